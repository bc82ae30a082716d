//! Tradeflow configuration (`tradeflow.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Run configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to conservative values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TradeflowConfig {
    /// Model turns per phase before the loop gives up.
    pub max_steps: u32,

    /// Corrective turns for one tool before the host invokes it directly.
    pub correction_threshold: u32,

    /// Model calls allowed across the whole run.
    pub max_llm_calls: u32,

    /// Write tools return a simulated outcome instead of running.
    pub dry_run: bool,

    /// Checklist sub-mode (e.g. `intraday`, `swing`). Falls back to the
    /// checklist's `default_mode`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Where run artifacts are written. No artifacts when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_log_dir: Option<PathBuf>,

    pub model: ModelConfig,

    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command that reads a chat request on stdin and prints a reply on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["tradeflow-model".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Limits for command-backed tool handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TradeflowConfig {
    fn default() -> Self {
        Self {
            max_steps: 24,
            correction_threshold: 3,
            max_llm_calls: 40,
            dry_run: false,
            mode: None,
            run_log_dir: None,
            model: ModelConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl TradeflowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.correction_threshold == 0 {
            return Err(anyhow!("correction_threshold must be > 0"));
        }
        if self.max_llm_calls == 0 {
            return Err(anyhow!("max_llm_calls must be > 0"));
        }
        if self.model.timeout_secs == 0 || self.tools.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs and tools.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 || self.tools.output_limit_bytes == 0 {
            return Err(anyhow!(
                "model.output_limit_bytes and tools.output_limit_bytes must be > 0"
            ));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.mode.as_deref().is_some_and(|mode| mode.trim().is_empty()) {
            return Err(anyhow!("mode must not be empty when set"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TradeflowConfig::default()`.
pub fn load_config(path: &Path) -> Result<TradeflowConfig> {
    if !path.exists() {
        let cfg = TradeflowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TradeflowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TradeflowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
