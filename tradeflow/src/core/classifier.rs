//! Deterministic classification of free-text model replies.
//!
//! A text reply only ends a loop when it is a genuine final answer. Replies
//! that contain code, that announce a tool call instead of making it, or that
//! arrive before the workflow is complete are non-compliant and trigger a
//! corrective turn.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use serde::Serialize;

/// Classification of a free-text reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextClass {
    /// Plain-text answer after the workflow completed.
    Final,
    /// Code, pseudo tool-call syntax or tool-call JSON written as text.
    CodeLike,
    /// Prose announcing a tool call ("I will now call ...").
    StatedIntent,
    /// Otherwise acceptable text, but required tools are still pending.
    Incomplete,
}

impl TextClass {
    pub fn as_str(self) -> &'static str {
        match self {
            TextClass::Final => "final",
            TextClass::CodeLike => "code_like",
            TextClass::StatedIntent => "stated_intent",
            TextClass::Incomplete => "incomplete",
        }
    }
}

static CODE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"```",
        r"(?m)^\s*(def |class |import |from \S+ import |print\(|return |if __name__)",
        r"(?i)</?tool_call>|<function=|\bfunctions\.[a-z_]",
        r#""(name|tool|function|tool_name)"\s*:\s*""#,
        r#""arguments"\s*:"#,
        // Dotted or snake_case identifiers written as a call: `market.trend.analyze(`.
        r"\b[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)+\s*\(",
        r"\b[a-z][a-z0-9]*_[a-z0-9_]+\s*\(",
    ])
    .expect("code patterns must compile")
});

static INTENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(i will|i'll|i am going to|i'm going to|let me|let's|i need to|i should|i shall|i can now|i'll now)\s+(now\s+|first\s+|next\s+)?(call|use|invoke|run|fetch|get|execute|check|retrieve|place|build|analy[sz]e|calculate|compute|look up|proceed)\b",
        r"(?i)\b(calling|invoking)\s+(the\s+)?(`|[a-z_]+\.[a-z_]+|tool\b|function\b)",
        r"(?i)\bproceed(ing)?\s+(to|with)\s+(call|invoke|fetch|the next (tool|step))",
        r"(?i)\bnext,?\s+(i|we)\s+(will|need to|should)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("intent pattern must compile"))
    .collect()
});

/// Classify a text reply.
///
/// Priority: code-like, then stated intent, then workflow completeness.
/// Blank replies never count as a final answer.
pub fn classify_response(text: &str, workflow_complete: bool) -> TextClass {
    if CODE_PATTERNS.is_match(text) {
        return TextClass::CodeLike;
    }
    if INTENT_PATTERNS.iter().any(|re| re.is_match(text)) {
        return TextClass::StatedIntent;
    }
    if !workflow_complete || text.trim().is_empty() {
        return TextClass::Incomplete;
    }
    TextClass::Final
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_summary_after_completion_is_final() {
        let text = "Analysis complete. Trend is bullish, plan built with entry 95.25 and stop 71.50.";
        assert_eq!(classify_response(text, true), TextClass::Final);
    }

    #[test]
    fn plain_summary_before_completion_is_incomplete() {
        let text = "The trend looks bullish.";
        assert_eq!(classify_response(text, false), TextClass::Incomplete);
    }

    #[test]
    fn blank_reply_is_never_final() {
        assert_eq!(classify_response("   ", true), TextClass::Incomplete);
    }

    #[test]
    fn fenced_code_is_code_like() {
        let text = "Here you go:\n```python\nfetch_expiry_list(symbol='NIFTY')\n```";
        assert_eq!(classify_response(text, true), TextClass::CodeLike);
    }

    #[test]
    fn call_syntax_in_prose_is_code_like() {
        assert_eq!(
            classify_response("Run market.option.chain(expiry=\"2024-06-27\") next", false),
            TextClass::CodeLike
        );
        assert_eq!(
            classify_response("fetch_expiry_list(symbol)", true),
            TextClass::CodeLike
        );
    }

    #[test]
    fn tool_call_json_in_text_is_code_like() {
        let text = r#"{"name": "market.trend.analyze", "arguments": {"symbol": "NIFTY"}}"#;
        assert_eq!(classify_response(text, false), TextClass::CodeLike);
    }

    #[test]
    fn announced_call_is_stated_intent() {
        for text in [
            "I will now call the expiry list tool.",
            "Let me fetch the option chain for the nearest expiry.",
            "Next, I will build the trade plan.",
            "Calling `market.option.chain` with the nearest expiry.",
        ] {
            assert_eq!(classify_response(text, true), TextClass::StatedIntent, "{text}");
        }
    }

    #[test]
    fn negated_intent_is_not_stated_intent() {
        let text = "I will not place any order because the trend is avoid.";
        assert_eq!(classify_response(text, true), TextClass::Final);
    }
}
