//! Run artifacts under `<run_log_dir>/<run_id>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::core::context::ExecutionContext;
use crate::core::conversation::Conversation;
use crate::pipeline::RunReport;

#[derive(Debug, Clone)]
pub struct RunLogPaths {
    pub dir: PathBuf,
    pub report_path: PathBuf,
    pub conversation_path: PathBuf,
    pub context_path: PathBuf,
}

impl RunLogPaths {
    pub fn new(root: &Path, run_id: &str) -> Self {
        let dir = root.join(run_id);
        Self {
            report_path: dir.join("report.json"),
            conversation_path: dir.join("conversation.json"),
            context_path: dir.join("context.json"),
            dir,
        }
    }
}

pub struct RunLogWriteRequest<'a> {
    pub root: &'a Path,
    pub report: &'a RunReport,
    pub conversation: &'a Conversation,
    pub context: &'a ExecutionContext,
}

pub fn write_run_log(request: &RunLogWriteRequest<'_>) -> Result<RunLogPaths> {
    validate_id(&request.report.run_id)?;
    let paths = RunLogPaths::new(request.root, &request.report.run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create run log dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.report_path, request.report)?;
    write_json(&paths.conversation_path, request.conversation)?;
    write_json(&paths.context_path, request.context)?;

    debug!(dir = %paths.dir.display(), "run log written");
    Ok(paths)
}

/// `run-<unix millis>`, suffixed until no directory with that name exists
/// under `root`.
pub fn generate_run_id(root: &Path) -> Result<String> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_millis();
    let base = format!("run-{millis}");
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !root.join(&id).exists() {
            return Ok(id);
        }
    }
    Err(anyhow!(
        "unable to generate unique run id from base '{base}' (too many existing runs)"
    ))
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(anyhow!("invalid run id '{id}'"));
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
