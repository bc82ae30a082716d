//! System-wide kill conditions.
//!
//! Independent of phase checklists: any of these halts the whole system, and
//! a halt takes precedence over whatever the current phase concluded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{GuardAction, GuardFailure, GuardResult};

pub const RULE_DAILY_LOSS: &str = "kill.daily_loss";
pub const RULE_FEED_DISCONNECTED: &str = "kill.feed_disconnected";
pub const RULE_DUPLICATE_EXECUTION: &str = "kill.duplicate_execution";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchState {
    /// Realized loss for the day. Sign is ignored; the magnitude is compared.
    pub daily_loss: f64,
    /// Loss limit. Zero or negative disables the loss check.
    pub max_daily_loss: f64,
    pub websocket_connected: bool,
    pub has_position: bool,
    pub duplicate_execution: bool,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            daily_loss: 0.0,
            max_daily_loss: 0.0,
            websocket_connected: true,
            has_position: false,
            duplicate_execution: false,
        }
    }
}

impl KillSwitchState {
    /// Read the kill-switch fields from a context snapshot. Missing fields
    /// take their defaults; malformed fields are an error.
    pub fn from_snapshot(snapshot: &Value) -> Result<Self, String> {
        let Value::Object(map) = snapshot else {
            return Err("kill-switch snapshot must be a JSON object".to_string());
        };
        let fields: serde_json::Map<String, Value> = map
            .iter()
            .filter(|(key, value)| {
                !value.is_null()
                    && matches!(
                        key.as_str(),
                        "daily_loss"
                            | "max_daily_loss"
                            | "websocket_connected"
                            | "has_position"
                            | "duplicate_execution"
                    )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        serde_json::from_value(Value::Object(fields))
            .map_err(|err| format!("invalid kill-switch state: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillVerdict {
    pub should_halt: bool,
    pub reason: String,
    #[serde(skip)]
    failures: Vec<GuardFailure>,
}

impl KillVerdict {
    /// The verdict as a guard result (`stop_system` when halting).
    pub fn to_guard_result(&self) -> GuardResult {
        if self.should_halt {
            GuardResult::fail(self.failures.clone(), GuardAction::StopSystem)
        } else {
            GuardResult::pass()
        }
    }
}

/// Evaluate all kill conditions. Every triggered condition is reported.
pub fn check_kill_conditions(state: &KillSwitchState) -> KillVerdict {
    let mut failures = Vec::new();

    let loss = state.daily_loss.abs();
    if state.max_daily_loss > 0.0 && loss >= state.max_daily_loss {
        failures.push(GuardFailure {
            rule_id: RULE_DAILY_LOSS.to_string(),
            description: format!(
                "daily loss {loss:.2} breached limit {:.2}",
                state.max_daily_loss
            ),
        });
    }
    if !state.websocket_connected && state.has_position {
        failures.push(GuardFailure {
            rule_id: RULE_FEED_DISCONNECTED.to_string(),
            description: "market feed disconnected while holding a position".to_string(),
        });
    }
    if state.duplicate_execution {
        failures.push(GuardFailure {
            rule_id: RULE_DUPLICATE_EXECUTION.to_string(),
            description: "duplicate order execution detected".to_string(),
        });
    }

    let reason = if failures.is_empty() {
        "no kill condition met".to_string()
    } else {
        failures
            .iter()
            .map(|failure| failure.description.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };
    KillVerdict {
        should_halt: !failures.is_empty(),
        reason,
        failures,
    }
}
