//! Side-effecting edges: config files, child processes, prompts, run logs.

pub mod alerts;
pub mod checklist_config;
pub mod config;
pub mod model;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod tool_manifest;
