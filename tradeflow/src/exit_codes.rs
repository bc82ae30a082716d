//! Stable exit codes for tradeflow CLI commands.

/// Command succeeded; a run completed or a checklist passed.
pub const OK: i32 = 0;
/// Invalid config/checklist/manifest/input, or a run error (non-convergence,
/// exhausted model budget, unrecoverable tool failure).
pub const INVALID: i32 = 1;
/// The run ended without a trade (`no_trade`).
pub const NO_TRADE: i32 = 2;
/// A checklist rejected the trade or a phase failed.
pub const REJECTED: i32 = 3;
/// A system-wide halt: STOP_SYSTEM guard action or kill switch.
pub const HALTED: i32 = 4;
