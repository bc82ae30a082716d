//! Command-backed tools declared in TOML.
//!
//! A manifest binds built-in tool contracts to external commands, declares
//! new tools with their own descriptors, and may replace the workflow of any
//! phase:
//!
//! ```toml
//! [bindings."market.instrument.resolve"]
//! command = ["python3", "tools/instrument.py"]
//!
//! [[tools]]
//! name = "market.trend.analyze"
//! category = "market_data"
//! command = ["python3", "tools/trend.py"]
//! produces = { trend = "trend" }
//!
//! [workflows.analysis]
//! name = "analysis"
//! steps = [{ tool = "market.trend.analyze" }]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info};

use crate::core::descriptor::ToolDescriptor;
use crate::core::types::Phase;
use crate::core::workflow::Workflow;
use crate::io::config::ToolsConfig;
use crate::tools::{CommandHandler, ToolRegistry};
use crate::workflows::builtin_descriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct CommandBinding {
    pub command: Vec<String>,
    /// Overrides `tools.timeout_secs` for this tool.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandBinding {
    fn validate(&self, name: &str, errors: &mut Vec<String>) {
        if self.command.first().is_none_or(|program| program.trim().is_empty()) {
            errors.push(format!("tool '{name}': command must be a non-empty array"));
        }
        if self.timeout_secs == Some(0) {
            errors.push(format!("tool '{name}': timeout_secs must be > 0"));
        }
    }

    fn handler(&self, limits: &ToolsConfig) -> CommandHandler {
        let timeout = self
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| limits.timeout());
        CommandHandler::new(self.command.clone(), timeout, limits.output_limit_bytes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTool {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
    #[serde(flatten)]
    pub binding: CommandBinding,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolManifest {
    /// Built-in tool name -> command.
    pub bindings: BTreeMap<String, CommandBinding>,
    pub tools: Vec<ManifestTool>,
    pub workflows: BTreeMap<Phase, Workflow>,
}

impl ToolManifest {
    /// Structural problems that do not depend on other registered tools.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, binding) in &self.bindings {
            if builtin_descriptor(name).is_none() {
                errors.push(format!("binding '{name}' does not name a built-in tool"));
            }
            binding.validate(name, &mut errors);
        }
        for tool in &self.tools {
            let name = &tool.descriptor.name;
            if self.bindings.contains_key(name) {
                errors.push(format!("tool '{name}' is both bound and declared"));
            }
            tool.binding.validate(name, &mut errors);
            errors.extend(
                tool.descriptor
                    .validate()
                    .into_iter()
                    .map(|err| format!("tool '{name}': {err}")),
            );
        }
        for (phase, workflow) in &self.workflows {
            errors.extend(
                workflow
                    .validate()
                    .into_iter()
                    .map(|err| format!("workflow {phase}: {err}")),
            );
        }
        errors
    }
}

pub fn parse_tool_manifest(raw: &str, origin: &str) -> Result<ToolManifest> {
    let manifest: ToolManifest = toml::from_str(raw).with_context(|| format!("parse {origin}"))?;
    let errors = manifest.validate();
    if !errors.is_empty() {
        return Err(anyhow!(
            "invalid tool manifest {origin}:\n- {}",
            errors.join("\n- ")
        ));
    }
    Ok(manifest)
}

pub fn load_tool_manifest(path: &Path) -> Result<ToolManifest> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let manifest = parse_tool_manifest(&raw, &path.display().to_string())?;
    debug!(
        path = %path.display(),
        bindings = manifest.bindings.len(),
        tools = manifest.tools.len(),
        workflows = manifest.workflows.len(),
        "tool manifest loaded"
    );
    Ok(manifest)
}

/// Register every bound built-in and every declared tool with a
/// [`CommandHandler`].
pub fn register_manifest_tools(
    registry: &mut ToolRegistry,
    manifest: &ToolManifest,
    limits: &ToolsConfig,
) -> Result<()> {
    for (name, binding) in &manifest.bindings {
        let descriptor =
            builtin_descriptor(name).ok_or_else(|| anyhow!("unknown built-in tool '{name}'"))?;
        registry
            .register(descriptor, binding.handler(limits))
            .with_context(|| format!("register bound tool '{name}'"))?;
    }
    for tool in &manifest.tools {
        registry
            .register(tool.descriptor.clone(), tool.binding.handler(limits))
            .with_context(|| format!("register manifest tool '{}'", tool.descriptor.name))?;
    }
    info!(
        bindings = manifest.bindings.len(),
        tools = manifest.tools.len(),
        "manifest tools registered"
    );
    Ok(())
}

/// Every workflow step must name a registered tool.
pub fn check_workflow_tools(registry: &ToolRegistry, workflows: &BTreeMap<Phase, Workflow>) -> Result<()> {
    let missing: Vec<String> = workflows
        .iter()
        .flat_map(|(phase, workflow)| {
            workflow
                .tools()
                .filter(|tool| !registry.contains(tool))
                .map(move |tool| format!("{phase}: '{tool}'"))
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "workflow steps name unregistered tools: {}",
            missing.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[bindings."market.instrument.resolve"]
command = ["sh", "-c", "cat >/dev/null; printf '{\"symbol\": \"NIFTY\", \"lot_size\": 75}'"]

[[tools]]
name = "market.vix.level"
category = "market_data"
description = "Current India VIX level."
command = ["sh", "-c", "printf '{\"vix\": 14.2}'"]
timeout_secs = 5
produces = { vix = "vix" }

[[tools.outputs]]
name = "vix"
type = "number"
required = true

[workflows.analysis]
name = "analysis"
steps = [{ tool = "market.vix.level" }]
"#;

    #[test]
    fn parses_tools_and_workflows() {
        let manifest = parse_tool_manifest(MANIFEST, "test").expect("parse");
        assert_eq!(manifest.tools.len(), 1);
        assert_eq!(manifest.tools[0].descriptor.name, "market.vix.level");
        assert_eq!(manifest.tools[0].descriptor.outputs.len(), 1);
        assert_eq!(manifest.tools[0].binding.timeout_secs, Some(5));
        assert!(manifest.workflows.contains_key(&Phase::Analysis));
    }

    #[test]
    fn registers_command_handlers() {
        let manifest = parse_tool_manifest(MANIFEST, "test").expect("parse");
        let mut registry = ToolRegistry::new();
        register_manifest_tools(&mut registry, &manifest, &ToolsConfig::default())
            .expect("register");
        assert!(registry.contains("market.vix.level"));
        assert!(registry.contains("market.instrument.resolve"));
        check_workflow_tools(&registry, &manifest.workflows).expect("workflow tools");
    }

    #[test]
    fn empty_command_is_rejected() {
        let raw = "[[tools]]\nname = \"a.b\"\ncategory = \"x\"\ncommand = []\n";
        let err = parse_tool_manifest(raw, "test").expect_err("invalid");
        assert!(format!("{err:#}").contains("command must be a non-empty array"));
    }

    #[test]
    fn bindings_must_name_builtin_tools() {
        let raw = "[bindings.\"market.news.latest\"]\ncommand = [\"news\"]\n";
        let err = parse_tool_manifest(raw, "test").expect_err("invalid");
        assert!(format!("{err:#}").contains("does not name a built-in tool"));
    }

    #[test]
    fn unknown_workflow_tools_are_reported() {
        let mut workflows = BTreeMap::new();
        workflows.insert(Phase::Validation, Workflow::new("validation").step("risk.trade.assess"));
        let err = check_workflow_tools(&ToolRegistry::new(), &workflows).expect_err("missing");
        assert!(err.to_string().contains("validation: 'risk.trade.assess'"));
    }

    #[cfg(unix)]
    #[test]
    fn manifest_tool_runs_through_registry() {
        use crate::core::context::ExecutionContext;
        use serde_json::{Map, json};

        let manifest = parse_tool_manifest(MANIFEST, "test").expect("parse");
        let mut registry = ToolRegistry::new();
        register_manifest_tools(&mut registry, &manifest, &ToolsConfig::default())
            .expect("register");
        let mut ctx = ExecutionContext::default();
        registry
            .call("market.vix.level", &Map::new(), &mut ctx)
            .into_result()
            .expect("call");
        assert_eq!(ctx.get("vix"), Some(&json!(14.2)));

        let mut args = Map::new();
        args.insert("symbol".into(), json!("NIFTY"));
        registry
            .call("market.instrument.resolve", &args, &mut ctx)
            .into_result()
            .expect("bound call");
        assert_eq!(ctx.get("lot_size"), Some(&json!(75)));
    }
}
