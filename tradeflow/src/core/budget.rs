//! Shared call budget for model invocations across one run.

use serde::Serialize;

/// Counts model calls against a fixed limit. Shared by every phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallBudget {
    limit: u32,
    used: u32,
}

impl CallBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Take one call from the budget. Returns `false` (and consumes nothing)
    /// once the limit is reached.
    pub fn consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}
