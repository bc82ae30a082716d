//! Gated, one-directional phase progression.

use serde::Serialize;

use crate::core::types::{GuardResult, Phase, RunStatus};

/// Result of applying one guard verdict to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Advanced { from: Phase, to: Phase },
    Completed { phase: Phase },
    Terminated { phase: Phase, status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseMachine {
    current: Phase,
    status: RunStatus,
    visited: Vec<Phase>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Precheck,
            status: RunStatus::Running,
            visited: vec![Phase::Precheck],
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Phases entered so far, in order.
    pub fn visited(&self) -> &[Phase] {
        &self.visited
    }

    /// Apply the guard verdict for the current phase.
    ///
    /// A pass advances to the next phase (or completes the run after the last
    /// one). A failure ends the run in the status named by the guard action.
    pub fn apply(&mut self, guard: &GuardResult) -> Result<Transition, String> {
        if self.status.is_terminal() {
            return Err(format!(
                "run already ended with status {:?} in phase {}",
                self.status, self.current
            ));
        }
        let phase = self.current;
        if !guard.passed {
            let status = RunStatus::from_action(guard.action);
            if status == RunStatus::Running {
                return Err(format!(
                    "guard for {phase} failed without a terminal action"
                ));
            }
            self.status = status;
            return Ok(Transition::Terminated { phase, status });
        }
        match phase.next() {
            Some(next) => {
                self.current = next;
                self.visited.push(next);
                Ok(Transition::Advanced {
                    from: phase,
                    to: next,
                })
            }
            None => {
                self.status = RunStatus::Completed;
                Ok(Transition::Completed { phase })
            }
        }
    }

    /// End the run as a system-wide stop, regardless of the current phase.
    pub fn halt(&mut self) -> Transition {
        self.status = RunStatus::Stopped;
        Transition::Terminated {
            phase: self.current,
            status: RunStatus::Stopped,
        }
    }

    /// End the run in the current phase without a guard verdict (e.g. the
    /// phase's agent loop failed).
    pub fn finish(&mut self, status: RunStatus) -> Transition {
        self.status = status;
        Transition::Terminated {
            phase: self.current,
            status,
        }
    }
}
