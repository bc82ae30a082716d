//! Fixed tool order for one phase, with declarative skip edges.
//!
//! A workflow lists the tools a phase needs in order. Skip rules short-circuit
//! part of the list when a context value matches (e.g. `trend` is `avoid`), so
//! "which tool is next" stays a pure function of the workflow and the context.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::context::ExecutionContext;
use crate::core::descriptor::ToolDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub tool: String,
    /// Input name -> context path used when the host invokes the tool itself.
    /// Inputs not listed here resolve from the context key of the same name.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// Skip `skip` when the value at `when` is one of `in_values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRule {
    pub when: String,
    pub in_values: Vec<Value>,
    pub skip: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

impl SkipRule {
    pub fn is_active(&self, ctx: &ExecutionContext) -> bool {
        ctx.get(&self.when)
            .is_some_and(|value| self.in_values.contains(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub skip_rules: Vec<SkipRule>,
    /// Once this tool has run (or been skipped) the workflow is complete.
    #[serde(default)]
    pub terminal: Option<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            skip_rules: Vec::new(),
            terminal: None,
        }
    }

    pub fn step(self, tool: impl Into<String>) -> Self {
        self.step_with(tool, &[])
    }

    pub fn step_with(mut self, tool: impl Into<String>, args: &[(&str, &str)]) -> Self {
        self.steps.push(WorkflowStep {
            tool: tool.into(),
            args: args
                .iter()
                .map(|(input, path)| (input.to_string(), path.to_string()))
                .collect(),
        });
        self
    }

    pub fn skip_when(
        mut self,
        when: impl Into<String>,
        in_values: Vec<Value>,
        skip: &[&str],
        reason: impl Into<String>,
    ) -> Self {
        self.skip_rules.push(SkipRule {
            when: when.into(),
            in_values,
            skip: skip.iter().map(|tool| tool.to_string()).collect(),
            reason: reason.into(),
        });
        self
    }

    pub fn terminal(mut self, tool: impl Into<String>) -> Self {
        self.terminal = Some(tool.into());
        self
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.tool.as_str())
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools().any(|name| name == tool)
    }

    pub fn step_for(&self, tool: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.tool == tool)
    }

    /// Structural problems (empty on success).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.steps.is_empty() {
            errors.push(format!("workflow '{}' has no steps", self.name));
        }
        let mut seen = BTreeSet::new();
        for tool in self.tools() {
            if !seen.insert(tool) {
                errors.push(format!("workflow '{}' lists '{tool}' twice", self.name));
            }
        }
        for rule in &self.skip_rules {
            for tool in &rule.skip {
                if !seen.contains(tool.as_str()) {
                    errors.push(format!(
                        "skip rule on '{}' names unknown step '{tool}'",
                        rule.when
                    ));
                }
            }
        }
        if let Some(terminal) = &self.terminal
            && !seen.contains(terminal.as_str())
        {
            errors.push(format!("terminal '{terminal}' is not a step"));
        }
        errors
    }

    /// Tools removed from the plan by currently active skip rules.
    pub fn skipped_tools(&self, ctx: &ExecutionContext) -> BTreeSet<String> {
        self.skip_rules
            .iter()
            .filter(|rule| rule.is_active(ctx))
            .flat_map(|rule| rule.skip.iter().cloned())
            .collect()
    }

    /// The first active skip rule, if any.
    pub fn short_circuited(&self, ctx: &ExecutionContext) -> Option<&SkipRule> {
        self.skip_rules.iter().find(|rule| rule.is_active(ctx))
    }

    /// The single next tool the phase still needs, in workflow order.
    pub fn next_required(&self, ctx: &ExecutionContext) -> Option<&WorkflowStep> {
        if self.terminal_reached(ctx) {
            return None;
        }
        let skipped = self.skipped_tools(ctx);
        self.steps
            .iter()
            .find(|step| !ctx.has_called(&step.tool) && !skipped.contains(&step.tool))
    }

    pub fn is_complete(&self, ctx: &ExecutionContext) -> bool {
        self.next_required(ctx).is_none()
    }

    fn terminal_reached(&self, ctx: &ExecutionContext) -> bool {
        let Some(terminal) = &self.terminal else {
            return false;
        };
        ctx.has_called(terminal) || self.skipped_tools(ctx).contains(terminal)
    }

    /// Arguments for a host-initiated call of `step`, taken from the context.
    ///
    /// Derived inputs are left out; the registry fills those itself. Fails
    /// naming the first required input that cannot be resolved.
    pub fn resolve_args(
        &self,
        step: &WorkflowStep,
        descriptor: &ToolDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, String> {
        let mut args = Map::new();
        for field in &descriptor.inputs {
            if descriptor.is_derived(&field.name) {
                continue;
            }
            let path = input_path(step, &field.name);
            match ctx.get(path) {
                Some(value) => {
                    args.insert(field.name.clone(), value.clone());
                }
                None if field.required => {
                    return Err(format!(
                        "cannot resolve input `{}` from context path `{path}`",
                        field.name
                    ));
                }
                None => {}
            }
        }
        Ok(args)
    }

    /// Every input value the context can already supply for `step`,
    /// including derived ones. Used to name concrete values in corrections.
    pub fn concrete_values(
        &self,
        step: &WorkflowStep,
        descriptor: &ToolDescriptor,
        ctx: &ExecutionContext,
    ) -> Map<String, Value> {
        let mut values = Map::new();
        for field in &descriptor.inputs {
            let path = descriptor
                .dependencies
                .derived_inputs
                .get(&field.name)
                .map(String::as_str)
                .unwrap_or_else(|| input_path(step, &field.name));
            if let Some(value) = ctx.get(path) {
                values.insert(field.name.clone(), value.clone());
            }
        }
        values
    }
}

fn input_path<'a>(step: &'a WorkflowStep, input: &'a str) -> &'a str {
    step.args.get(input).map(String::as_str).unwrap_or(input)
}
