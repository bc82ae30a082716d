//! Prompt rendering for the agent loop.
//!
//! The system prompt is rebuilt every turn from the current context, so the
//! model always sees the values the host will use. Corrective turns come from
//! one template keyed by the kind of non-compliance.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::types::Phase;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const PHASE_START_TEMPLATE: &str = include_str!("prompts/phase_start.md");

/// Default byte budget for the system prompt.
pub const DEFAULT_PROMPT_BUDGET: usize = 24_000;

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .expect("system template should be valid");
    env.add_template("correction", CORRECTION_TEMPLATE)
        .expect("correction template should be valid");
    env.add_template("phase_start", PHASE_START_TEMPLATE)
        .expect("phase start template should be valid");
    env
});

/// State of one workflow step as shown to the model.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub tool: String,
    /// `done`, `next`, `pending` or `skipped`.
    pub state: &'static str,
}

#[derive(Debug, Clone)]
pub struct SystemPromptInputs<'a> {
    pub task: &'a str,
    pub phase: Phase,
    pub mode: Option<&'a str>,
    pub next_tool: Option<&'a str>,
    pub steps: Vec<StepView>,
    pub context: &'a Map<String, Value>,
}

/// Why a corrective turn is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionReason {
    CodeLike,
    StatedIntent,
    Incomplete,
    Serial,
    NotOffered,
    ToolError,
}

impl CorrectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrectionReason::CodeLike => "code_like",
            CorrectionReason::StatedIntent => "stated_intent",
            CorrectionReason::Incomplete => "incomplete",
            CorrectionReason::Serial => "serial",
            CorrectionReason::NotOffered => "not_offered",
            CorrectionReason::ToolError => "tool_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ValueView {
    name: String,
    value: String,
}

/// Inputs for one corrective user turn.
#[derive(Debug, Clone)]
pub struct Correction<'a> {
    pub reason: CorrectionReason,
    pub phase: Phase,
    /// The single tool the model must call next, if any.
    pub tool: Option<&'a str>,
    /// Concrete values the host will use for that tool.
    pub values: Map<String, Value>,
    /// Counter value after this correction (0 when not counted).
    pub attempt: u32,
    pub threshold: u32,
    pub detail: Option<String>,
    /// How many calls the turn proposed and which one the host took. Any
    /// reason with `proposed > 1` also asks for one call per turn.
    pub proposed: usize,
    pub executed: Option<&'a str>,
    /// For `NotOffered`: the tool the model asked for.
    pub offered_tool: Option<&'a str>,
}

impl<'a> Correction<'a> {
    pub fn new(reason: CorrectionReason, phase: Phase, tool: Option<&'a str>) -> Self {
        Self {
            reason,
            phase,
            tool,
            values: Map::new(),
            attempt: 0,
            threshold: 0,
            detail: None,
            proposed: 0,
            executed: None,
            offered_tool: None,
        }
    }
}

/// Render a corrective user message.
pub fn render_correction(correction: &Correction<'_>) -> Result<String> {
    let values: Vec<ValueView> = correction
        .values
        .iter()
        .map(|(name, value)| ValueView {
            name: name.clone(),
            value: value.to_string(),
        })
        .collect();
    let template = ENGINE.get_template("correction")?;
    let rendered = template
        .render(context! {
            reason => correction.reason.as_str(),
            phase => correction.phase.as_str(),
            tool => correction.tool,
            values => values,
            attempt => (correction.attempt > 0).then_some(correction.attempt),
            threshold => correction.threshold,
            detail => correction.detail.as_deref(),
            proposed => correction.proposed,
            executed => correction.executed,
            offered_tool => correction.offered_tool,
        })
        .context("render correction prompt")?;
    Ok(rendered.trim().to_string())
}

/// Render the user message that opens a phase.
pub fn render_phase_start(task: &str, phase: Phase, next_tool: Option<&str>) -> Result<String> {
    let template = ENGINE.get_template("phase_start")?;
    let rendered = template
        .render(context! {
            task => task.trim(),
            phase => phase.as_str(),
            next_tool => next_tool,
        })
        .context("render phase start prompt")?;
    Ok(rendered.trim().to_string())
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker pattern must compile")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                &caps[2] == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next_start = markers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*end..next_start].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections, then truncate the last one, until the budget fits.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["context"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(12));
        last.content.truncate(keep);
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds the per-turn system prompt within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_system(&self, input: &SystemPromptInputs<'_>) -> Result<String> {
        let context_json = serde_json::to_string_pretty(input.context)
            .context("serialize context for prompt")?;
        let template = ENGINE.get_template("system")?;
        let rendered = template
            .render(context! {
                task => input.task.trim(),
                phase => input.phase.as_str(),
                mode => input.mode,
                next_tool => input.next_tool,
                steps => input.steps,
                context => context_json,
            })
            .context("render system prompt")?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}
