//! Phase-gated tool orchestration for LLM-driven options trading.
//!
//! A run walks five phases (precheck, analysis, validation, execution,
//! position tracking). Inside a phase an agent loop drives the model through
//! a fixed tool workflow; between phases a declarative checklist decides
//! whether the run may advance. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (descriptors, preconditions,
//!   workflows, classification, checklists, the phase machine). No I/O.
//! - **[`io`]**: Side-effecting operations (config files, model and tool
//!   processes, prompts, run logs, alerts).
//!
//! Orchestration modules ([`tools`], [`looping`], [`guard`], [`pipeline`])
//! combine the two to implement the CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod guard;
pub mod io;
pub mod logging;
pub mod looping;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod workflows;
