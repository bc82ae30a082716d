//! Checklist guard: phase checklists plus the system kill monitor.

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::core::checklist::Checklist;
use crate::core::kill_switch::{KillSwitchState, check_kill_conditions};
use crate::core::types::{GuardAction, GuardFailure, GuardResult, Phase};

/// Rule id reported when the kill-switch fields in the context are malformed.
pub const RULE_KILL_STATE_UNREADABLE: &str = "kill.state_unreadable";

/// When a phase's checklist runs relative to its agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTiming {
    /// Gate entry: the phase does no work unless the checklist passes.
    BeforeWork,
    /// Gate exit: the checklist judges what the phase produced.
    AfterWork,
}

impl GuardTiming {
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Precheck | Phase::Execution => GuardTiming::BeforeWork,
            Phase::Analysis | Phase::Validation | Phase::PositionTracking => GuardTiming::AfterWork,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChecklistGuard {
    checklist: Checklist,
    mode: Option<String>,
}

impl ChecklistGuard {
    pub fn new(checklist: Checklist, mode: Option<String>) -> Self {
        Self { checklist, mode }
    }

    pub fn checklist(&self) -> &Checklist {
        &self.checklist
    }

    /// The active sub-mode, falling back to the checklist default.
    pub fn mode(&self) -> Option<&str> {
        self.mode
            .as_deref()
            .or(self.checklist.default_mode.as_deref())
    }

    /// Market, feed, session and account readiness before any analysis.
    pub fn run_global_precheck(&self, values: &Map<String, Value>) -> GuardResult {
        self.run_phase_checks(Phase::Precheck, values)
    }

    #[instrument(skip_all, fields(phase = %phase, mode = self.mode().unwrap_or("-")))]
    pub fn run_phase_checks(&self, phase: Phase, values: &Map<String, Value>) -> GuardResult {
        let result = self.checklist.evaluate(phase, values, self.mode());
        if result.passed {
            debug!(advisories = result.failures.len(), "checklist passed");
        } else {
            warn!(action = ?result.action, reason = %result.reason(), "checklist failed");
        }
        result
    }

    /// Kill conditions read from a context snapshot. An unreadable state halts.
    #[instrument(skip_all)]
    pub fn check_system_kill_conditions(&self, snapshot: &Value) -> GuardResult {
        let state = match KillSwitchState::from_snapshot(snapshot) {
            Ok(state) => state,
            Err(err) => {
                warn!(err = %err, "kill-switch state unreadable");
                return GuardResult::fail(
                    vec![GuardFailure {
                        rule_id: RULE_KILL_STATE_UNREADABLE.to_string(),
                        description: err,
                    }],
                    GuardAction::StopSystem,
                );
            }
        };
        let verdict = check_kill_conditions(&state);
        if verdict.should_halt {
            warn!(reason = %verdict.reason, "kill switch triggered");
        }
        verdict.to_guard_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kill_switch::RULE_FEED_DISCONNECTED;
    use crate::io::checklist_config::default_checklist;
    use serde_json::json;

    fn guard(mode: Option<&str>) -> ChecklistGuard {
        ChecklistGuard::new(
            default_checklist().expect("default checklist"),
            mode.map(str::to_string),
        )
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn ready_market_passes_precheck() {
        let values = object(json!({
            "market_open": true,
            "websocket_connected": true,
            "authenticated": true,
        }));
        assert!(guard(None).run_global_precheck(&values).passed);
    }

    #[test]
    fn cooldown_ends_the_trade_without_halting() {
        let values = object(json!({
            "market_open": true,
            "websocket_connected": true,
            "authenticated": true,
            "cooldown_active": true,
        }));
        let result = guard(None).run_global_precheck(&values);
        assert!(!result.passed);
        assert_eq!(result.action, GuardAction::NoTrade);
    }

    #[test]
    fn mode_falls_back_to_checklist_default() {
        assert_eq!(guard(None).mode(), Some("intraday"));
        assert_eq!(guard(Some("swing")).mode(), Some("swing"));
    }

    #[test]
    fn disconnected_feed_with_position_halts() {
        let result = guard(None).check_system_kill_conditions(&json!({
            "websocket_connected": false,
            "has_position": true,
        }));
        assert!(!result.passed);
        assert_eq!(result.action, GuardAction::StopSystem);
        assert_eq!(result.failures[0].rule_id, RULE_FEED_DISCONNECTED);
    }

    #[test]
    fn malformed_kill_state_halts() {
        let result = guard(None).check_system_kill_conditions(&json!({"daily_loss": "a lot"}));
        assert_eq!(result.action, GuardAction::StopSystem);
        assert_eq!(result.failures[0].rule_id, RULE_KILL_STATE_UNREADABLE);
    }

    #[test]
    fn execution_is_gated_before_work() {
        assert_eq!(GuardTiming::for_phase(Phase::Execution), GuardTiming::BeforeWork);
        assert_eq!(GuardTiming::for_phase(Phase::Validation), GuardTiming::AfterWork);
    }
}
