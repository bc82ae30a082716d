//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod checklist;
pub mod classifier;
pub mod context;
pub mod conversation;
pub mod descriptor;
pub mod kill_switch;
pub mod path;
pub mod phase;
pub mod preconditions;
pub mod types;
pub mod workflow;
