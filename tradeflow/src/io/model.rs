//! Model abstraction for the agent loop.
//!
//! The [`ChatModel`] trait decouples the loop from the actual model backend.
//! [`CommandModel`] talks to an external process; tests use
//! `test_support::ScriptedModel`, which replays canned replies.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::conversation::{Message, ToolCall};
use crate::io::config::ModelConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::tools::ToolSchema;

/// Everything the model sees for one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// One model turn: free text, proposed tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

pub trait ChatModel {
    fn complete(&self, request: &ChatRequest) -> Result<ModelReply>;
}

/// Spawns the configured model command per turn: request JSON on stdin,
/// reply JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandModel {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.timeout(),
            config.output_limit_bytes,
        )
    }
}

impl ChatModel for CommandModel {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs(), messages = request.messages.len()))]
    fn complete(&self, request: &ChatRequest) -> Result<ModelReply> {
        info!("calling model command");
        let cmd = command_from_argv(&self.argv).context("model.command")?;
        let input = serde_json::to_vec(request).context("serialize chat request")?;
        let output = run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
            .context("run model command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model command timed out");
            return Err(anyhow!("model command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "model command failed");
            return Err(anyhow!(
                "model command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text("model")
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "model reply exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let reply: ModelReply =
            serde_json::from_slice(&output.stdout).context("parse model reply")?;
        debug!(
            tool_calls = reply.tool_calls.len(),
            has_text = reply.content.is_some(),
            "model replied"
        );
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            system: "contract".to_string(),
            messages: vec![Message::user("trade NIFTY")],
            tools: Vec::new(),
        }
    }

    fn sh(script: &str) -> CommandModel {
        CommandModel::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_secs(5),
            10_000,
        )
    }

    #[test]
    fn parses_tool_call_reply() {
        let model = sh(
            r#"cat >/dev/null; printf '{"tool_calls":[{"id":"c1","name":"market.trend.analyze","arguments":{}}]}'"#,
        );
        let reply = model.complete(&request()).expect("reply");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "market.trend.analyze");
        assert_eq!(reply.content, None);
    }

    #[test]
    fn model_sees_request_on_stdin() {
        // The reply text reports whether the request reached stdin.
        let model = sh(
            r#"grep -q '"system":"contract"' && printf '{"content":"seen"}' || printf '{"content":"missing"}'"#,
        );
        let reply = model.complete(&request()).expect("reply");
        assert_eq!(reply.content_str(), "seen");
    }

    #[test]
    fn failing_command_is_an_error() {
        let err = sh("echo boom >&2; exit 2")
            .complete(&request())
            .expect_err("failure");
        assert!(format!("{err:#}").contains("boom"));
    }
}
