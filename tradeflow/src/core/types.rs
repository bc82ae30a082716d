//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the registry, the agent loop,
//! the checklist guard and the phase machine. They carry no I/O and serialize
//! to stable snake_case names so run reports stay diffable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named stage of a trade run. Declaration order is the only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precheck,
    Analysis,
    Validation,
    Execution,
    PositionTracking,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Precheck,
        Phase::Analysis,
        Phase::Validation,
        Phase::Execution,
        Phase::PositionTracking,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Precheck => "precheck",
            Phase::Analysis => "analysis",
            Phase::Validation => "validation",
            Phase::Execution => "execution",
            Phase::PositionTracking => "position_tracking",
        }
    }

    /// The phase that follows `self`, or `None` for the last phase.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Precheck => Some(Phase::Analysis),
            Phase::Analysis => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Execution),
            Phase::Execution => Some(Phase::PositionTracking),
            Phase::PositionTracking => None,
        }
    }

    /// Action applied when a checklist for this phase fails and neither the
    /// phase nor the failing rule names one.
    pub fn default_guard_action(self) -> GuardAction {
        match self {
            Phase::Precheck => GuardAction::StopSystem,
            Phase::Analysis => GuardAction::NoTrade,
            Phase::Validation => GuardAction::Reject,
            Phase::Execution | Phase::PositionTracking => GuardAction::StopAndAlert,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

/// Coarse risk classification carried by tool descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    High,
}

/// What the run must do after a checklist evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    /// Halt the whole system process, not only this trade.
    StopSystem,
    /// End the current trade without placing anything.
    NoTrade,
    /// Reject the current trade.
    Reject,
    /// End the current trade and raise an operator alert.
    StopAndAlert,
    /// Proceed.
    Continue,
}

impl GuardAction {
    /// Ordering used to pick one action when several rules fail.
    pub fn severity(self) -> u8 {
        match self {
            GuardAction::Continue => 0,
            GuardAction::NoTrade => 1,
            GuardAction::Reject => 2,
            GuardAction::StopAndAlert => 3,
            GuardAction::StopSystem => 4,
        }
    }
}

/// A single failed checklist rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardFailure {
    pub rule_id: String,
    pub description: String,
}

/// Outcome of one guard evaluation. Never mutated, only superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    pub passed: bool,
    /// Failed rules. Advisory rules (action `continue`) may appear here even
    /// when `passed` is true.
    pub failures: Vec<GuardFailure>,
    pub action: GuardAction,
}

impl GuardResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
            action: GuardAction::Continue,
        }
    }

    pub fn fail(failures: Vec<GuardFailure>, action: GuardAction) -> Self {
        Self {
            passed: false,
            failures,
            action,
        }
    }

    /// Human-readable reason built from the failed rule descriptions.
    pub fn reason(&self) -> String {
        if self.failures.is_empty() {
            return "all checks passed".to_string();
        }
        self.failures
            .iter()
            .map(|failure| format!("[{}] {}", failure.rule_id, failure.description))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Overall status of a run owned by the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    NoTrade,
    Rejected,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }

    pub fn from_action(action: GuardAction) -> Self {
        match action {
            GuardAction::Continue => RunStatus::Running,
            GuardAction::NoTrade => RunStatus::NoTrade,
            GuardAction::Reject => RunStatus::Rejected,
            GuardAction::StopSystem | GuardAction::StopAndAlert => RunStatus::Stopped,
        }
    }
}

/// Externally reported final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    NoTrade,
    PrecheckFailed,
    AnalysisFailed,
    ValidationFailed,
    ExecutionFailed,
    SystemHalted,
}

impl FinalStatus {
    /// Failure status for a run that ended inside `phase`.
    pub fn failed_in(phase: Phase) -> Self {
        match phase {
            Phase::Precheck => FinalStatus::PrecheckFailed,
            Phase::Analysis => FinalStatus::AnalysisFailed,
            Phase::Validation => FinalStatus::ValidationFailed,
            // Position tracking runs after the order went out.
            Phase::Execution | Phase::PositionTracking => FinalStatus::ExecutionFailed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Completed => "completed",
            FinalStatus::NoTrade => "no_trade",
            FinalStatus::PrecheckFailed => "precheck_failed",
            FinalStatus::AnalysisFailed => "analysis_failed",
            FinalStatus::ValidationFailed => "validation_failed",
            FinalStatus::ExecutionFailed => "execution_failed",
            FinalStatus::SystemHalted => "system_halted",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_declaration_order() {
        let mut walked = vec![Phase::Precheck];
        let mut current = Phase::Precheck;
        while let Some(next) = current.next() {
            assert!(next > current);
            walked.push(next);
            current = next;
        }
        assert_eq!(walked, Phase::ALL.to_vec());
    }

    #[test]
    fn phase_parses_from_cli_names() {
        assert_eq!("validation".parse::<Phase>(), Ok(Phase::Validation));
        assert_eq!(
            "POSITION_TRACKING".parse::<Phase>(),
            Ok(Phase::PositionTracking)
        );
        assert!("settlement".parse::<Phase>().is_err());
    }

    #[test]
    fn stop_system_is_most_severe() {
        let actions = [
            GuardAction::Continue,
            GuardAction::NoTrade,
            GuardAction::Reject,
            GuardAction::StopAndAlert,
        ];
        for action in actions {
            assert!(GuardAction::StopSystem.severity() > action.severity());
        }
    }

    #[test]
    fn guard_reason_lists_failed_rules() {
        let result = GuardResult::fail(
            vec![GuardFailure {
                rule_id: "market_open".to_string(),
                description: "market must be open".to_string(),
            }],
            GuardAction::StopSystem,
        );
        assert_eq!(result.reason(), "[market_open] market must be open");
        assert_eq!(GuardResult::pass().reason(), "all checks passed");
    }

    #[test]
    fn final_status_serializes_snake_case() {
        let raw = serde_json::to_string(&FinalStatus::PrecheckFailed).expect("serialize");
        assert_eq!(raw, "\"precheck_failed\"");
        assert_eq!(
            FinalStatus::failed_in(Phase::PositionTracking),
            FinalStatus::ExecutionFailed
        );
    }
}
