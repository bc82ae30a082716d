//! Checklist rule sets loaded from TOML.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::checklist::Checklist;

/// The built-in trading checklist.
pub const DEFAULT_CHECKLIST: &str = include_str!("../../checklists/default.toml");

/// Parse and validate a checklist. `origin` names the source in errors.
pub fn parse_checklist(raw: &str, origin: &str) -> Result<Checklist> {
    let checklist: Checklist = toml::from_str(raw).with_context(|| format!("parse {origin}"))?;
    let errors = checklist.validate();
    if !errors.is_empty() {
        return Err(anyhow!(
            "invalid checklist {origin}:\n- {}",
            errors.join("\n- ")
        ));
    }
    Ok(checklist)
}

pub fn default_checklist() -> Result<Checklist> {
    parse_checklist(DEFAULT_CHECKLIST, "built-in checklist")
}

/// Load a checklist from `path`, or the built-in one when `path` is `None`.
pub fn load_checklist(path: Option<&Path>) -> Result<Checklist> {
    let Some(path) = path else {
        return default_checklist();
    };
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let checklist = parse_checklist(&raw, &path.display().to_string())?;
    debug!(path = %path.display(), phases = checklist.phases.len(), "checklist loaded");
    Ok(checklist)
}
