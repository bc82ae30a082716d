//! Error taxonomy for tool calls and runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::preconditions::Unmet;
use crate::core::types::{GuardResult, Phase};

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// The world is not in a state where the tool makes sense (e.g. no
    /// option chain for an `avoid` trend). Recoverable by a corrective turn.
    InvalidState,
    /// The upstream service failed.
    Upstream,
    Timeout,
    Internal,
}

impl HandlerErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerErrorKind::InvalidState => "invalid_state",
            HandlerErrorKind::Upstream => "upstream",
            HandlerErrorKind::Timeout => "timeout",
            HandlerErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidState, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Upstream, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Internal, message)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("invalid descriptor for `{tool}`: {}", errors.join("; "))]
    InvalidDescriptor { tool: String, errors: Vec<String> },
    #[error("precondition failed for `{tool}`: {unmet}")]
    PreconditionFailed { tool: String, unmet: Unmet },
    #[error("invalid arguments for `{tool}`: {}", errors.join("; "))]
    InvalidArguments { tool: String, errors: Vec<String> },
    #[error("handler `{tool}` failed: {error}")]
    Handler { tool: String, error: HandlerError },
    #[error("handler `{tool}` returned invalid output: {}", errors.join("; "))]
    InvalidOutput { tool: String, errors: Vec<String> },
}

impl ToolError {
    /// Whether a corrective turn can recover from this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ToolError::UnknownTool(_)
            | ToolError::PreconditionFailed { .. }
            | ToolError::InvalidArguments { .. } => true,
            ToolError::Handler { error, .. } => error.kind == HandlerErrorKind::InvalidState,
            ToolError::DuplicateTool(_)
            | ToolError::InvalidDescriptor { .. }
            | ToolError::InvalidOutput { .. } => false,
        }
    }

    /// Stable snake_case kind for outcomes and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::DuplicateTool(_) => "duplicate_tool",
            ToolError::InvalidDescriptor { .. } => "invalid_descriptor",
            ToolError::PreconditionFailed { .. } => "precondition_failed",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Handler { .. } => "handler_error",
            ToolError::InvalidOutput { .. } => "invalid_output",
        }
    }
}

/// Errors that end a run (or one phase of it).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no convergence in {phase} after {steps} steps (next required tool: {pending})")]
    NonConvergence {
        phase: Phase,
        steps: u32,
        pending: String,
    },
    #[error("model call budget exhausted ({limit} calls) during {phase}")]
    LlmBudgetExhausted { phase: Phase, limit: u32 },
    #[error("{phase} checklist failed: {}", guard.reason())]
    GuardRejected { phase: Phase, guard: GuardResult },
    #[error("kill switch triggered during {phase}: {reason}")]
    KillSwitchTriggered { phase: Phase, reason: String },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("model call failed during {phase}")]
    Model {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

impl RunError {
    /// Stable snake_case kind for run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::NonConvergence { .. } => "non_convergence",
            RunError::LlmBudgetExhausted { .. } => "llm_budget_exhausted",
            RunError::GuardRejected { .. } => "guard_rejected",
            RunError::KillSwitchTriggered { .. } => "kill_switch_triggered",
            RunError::Tool(_) => "tool_error",
            RunError::Model { .. } => "model_error",
        }
    }
}
