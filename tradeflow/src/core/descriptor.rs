//! Static tool contracts.
//!
//! A [`ToolDescriptor`] is everything the host knows about a tool without
//! running it: typed inputs/outputs, which earlier tools and context values it
//! depends on, which arguments the host supplies itself (derived inputs), and
//! the phases in which it may never run. Descriptors are immutable once
//! registered.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::path::{is_valid_context_path, is_valid_path};
use crate::core::types::{Phase, RiskLevel};

/// Semantic type of an input or output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn json_schema(self) -> Value {
        match self {
            FieldType::String => json!({"type": "string"}),
            FieldType::Number => json!({"type": "number"}),
            FieldType::Integer => json!({"type": "integer"}),
            FieldType::Boolean => json!({"type": "boolean"}),
            FieldType::Object => json!({"type": "object"}),
            FieldType::Array => json!({"type": "array"}),
            FieldType::Any => json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Ordering and state requirements checked before every invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolDependencies {
    /// Tools that must already have been called in this run.
    pub required_tools: Vec<String>,
    /// Context paths that must resolve to a value.
    pub required_outputs: Vec<String>,
    /// Input name -> context path. The context value replaces whatever the
    /// model supplied.
    pub derived_inputs: BTreeMap<String, String>,
    /// Phases in which the tool may not be called.
    pub forbidden_states: Vec<Phase>,
    pub max_calls_per_trade: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique dotted id, e.g. `market.trend.analyze`.
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub when_to_use: String,
    #[serde(default)]
    pub when_not_to_use: String,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    #[serde(default)]
    pub outputs: Vec<FieldSpec>,
    #[serde(default)]
    pub dependencies: ToolDependencies,
    /// Context key -> path inside the handler result (`$` for the whole result).
    #[serde(default)]
    pub produces: BTreeMap<String, String>,
    /// Reviewer-facing invariants. Not machine checked.
    #[serde(default)]
    pub safety_rules: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// Write tools short-circuit into a simulated outcome in dry-run mode.
    #[serde(default)]
    pub writes: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            description: String::new(),
            when_to_use: String::new(),
            when_not_to_use: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: ToolDependencies::default(),
            produces: BTreeMap::new(),
            safety_rules: Vec::new(),
            risk_level: RiskLevel::None,
            writes: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, when_to_use: impl Into<String>, when_not_to_use: impl Into<String>) -> Self {
        self.when_to_use = when_to_use.into();
        self.when_not_to_use = when_not_to_use.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>, kind: FieldType, required: bool) -> Self {
        self.inputs.push(FieldSpec {
            name: name.into(),
            kind,
            required,
            description: String::new(),
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, kind: FieldType, required: bool) -> Self {
        self.outputs.push(FieldSpec {
            name: name.into(),
            kind,
            required,
            description: String::new(),
        });
        self
    }

    pub fn requires_tool(mut self, tool: impl Into<String>) -> Self {
        self.dependencies.required_tools.push(tool.into());
        self
    }

    pub fn requires_output(mut self, path: impl Into<String>) -> Self {
        self.dependencies.required_outputs.push(path.into());
        self
    }

    pub fn derive_input(mut self, input: impl Into<String>, path: impl Into<String>) -> Self {
        self.dependencies
            .derived_inputs
            .insert(input.into(), path.into());
        self
    }

    pub fn forbid_in(mut self, phase: Phase) -> Self {
        self.dependencies.forbidden_states.push(phase);
        self
    }

    pub fn max_calls(mut self, limit: u32) -> Self {
        self.dependencies.max_calls_per_trade = Some(limit);
        self
    }

    pub fn produce(mut self, key: impl Into<String>, result_path: impl Into<String>) -> Self {
        self.produces.insert(key.into(), result_path.into());
        self
    }

    pub fn safety_rule(mut self, rule: impl Into<String>) -> Self {
        self.safety_rules.push(rule.into());
        self
    }

    pub fn risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    pub fn writes(mut self) -> Self {
        self.writes = true;
        self
    }

    pub fn is_derived(&self, input: &str) -> bool {
        self.dependencies.derived_inputs.contains_key(input)
    }

    /// Check structural problems. Returns stable messages (empty on success).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !is_valid_name(&self.name) {
            errors.push(format!(
                "name '{}' must be dotted segments of [a-z0-9_]",
                self.name
            ));
        }
        if self.category.trim().is_empty() {
            errors.push("category must not be empty".to_string());
        }

        check_unique_fields("input", &self.inputs, &mut errors);
        check_unique_fields("output", &self.outputs, &mut errors);

        let input_names: BTreeSet<&str> = self.inputs.iter().map(|f| f.name.as_str()).collect();
        for (input, path) in &self.dependencies.derived_inputs {
            if !input_names.contains(input.as_str()) {
                errors.push(format!("derived input '{input}' is not a declared input"));
            }
            if !is_valid_context_path(path) {
                errors.push(format!("derived input '{input}' has invalid path '{path}'"));
            }
        }
        for path in &self.dependencies.required_outputs {
            if !is_valid_context_path(path) {
                errors.push(format!("required output has invalid path '{path}'"));
            }
        }
        if self.dependencies.required_tools.contains(&self.name) {
            errors.push("tool cannot require itself".to_string());
        }
        if self.dependencies.max_calls_per_trade == Some(0) {
            errors.push("max_calls_per_trade must be > 0".to_string());
        }
        for (key, path) in &self.produces {
            if key.trim().is_empty() || key.contains('.') {
                errors.push(format!("produced key '{key}' must be a plain name"));
            }
            if !is_valid_path(path) {
                errors.push(format!("produced key '{key}' has invalid result path '{path}'"));
            }
        }

        errors
    }

    /// JSON Schema for the fully resolved arguments.
    pub fn input_schema(&self) -> Value {
        object_schema(self.inputs.iter())
    }

    /// JSON Schema for the handler result.
    pub fn output_schema(&self) -> Value {
        object_schema(self.outputs.iter())
    }

    /// Parameters advertised to the model. Derived inputs are omitted because
    /// the host supplies them.
    pub fn model_parameters(&self) -> Value {
        object_schema(self.inputs.iter().filter(|field| !self.is_derived(&field.name)))
    }

    /// Description advertised to the model, including usage guidance.
    pub fn model_description(&self) -> String {
        let mut buf = self.description.clone();
        if !self.when_to_use.is_empty() {
            buf.push_str(&format!("\nUse when: {}", self.when_to_use));
        }
        if !self.when_not_to_use.is_empty() {
            buf.push_str(&format!("\nDo not use when: {}", self.when_not_to_use));
        }
        buf.trim().to_string()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

fn check_unique_fields(label: &str, fields: &[FieldSpec], errors: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for field in fields {
        if field.name.trim().is_empty() {
            errors.push(format!("{label} field name must not be empty"));
        } else if !seen.insert(field.name.as_str()) {
            errors.push(format!("duplicate {label} field '{}'", field.name));
        }
    }
}

fn object_schema<'a>(fields: impl Iterator<Item = &'a FieldSpec>) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        let mut schema = field.kind.json_schema();
        if !field.description.is_empty()
            && let Some(obj) = schema.as_object_mut()
        {
            obj.insert("description".to_string(), json!(field.description));
        }
        properties.insert(field.name.clone(), schema);
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("market.option.chain", "market_data")
            .describe("Fetch the option chain for one expiry.")
            .usage("after an expiry is known", "when the trend is avoid")
            .input("symbol", FieldType::String, true)
            .input("expiry", FieldType::String, true)
            .input("depth", FieldType::Integer, false)
            .output("atm_strike", FieldType::Number, true)
            .derive_input("symbol", "instrument.symbol")
            .derive_input("expiry", "expiry")
            .produce("option_chain", "$")
    }

    #[test]
    fn valid_descriptor_has_no_errors() {
        assert!(chain_descriptor().validate().is_empty());
    }

    #[test]
    fn validate_reports_structural_problems() {
        let descriptor = ToolDescriptor::new("Market..Chain", "")
            .input("symbol", FieldType::String, true)
            .input("symbol", FieldType::String, false)
            .derive_input("strike", "chain..atm")
            .max_calls(0)
            .produce("chain.atm", "$");

        let errors = descriptor.validate();
        assert!(errors.iter().any(|e| e.contains("dotted segments")));
        assert!(errors.iter().any(|e| e.contains("category")));
        assert!(errors.iter().any(|e| e.contains("duplicate input field 'symbol'")));
        assert!(errors.iter().any(|e| e.contains("'strike' is not a declared input")));
        assert!(errors.iter().any(|e| e.contains("invalid path 'chain..atm'")));
        assert!(errors.iter().any(|e| e.contains("max_calls_per_trade")));
        assert!(errors.iter().any(|e| e.contains("plain name")));
    }

    #[test]
    fn whole_value_path_is_only_valid_for_produces() {
        let descriptor = ToolDescriptor::new("analysis.plan.build", "analysis")
            .input("chain", FieldType::Object, true)
            .derive_input("chain", "$")
            .requires_output("$")
            .produce("plan", "$");

        let errors = descriptor.validate();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("derived input 'chain' has invalid path '$'")));
        assert!(errors.iter().any(|e| e.contains("required output has invalid path '$'")));
    }

    #[test]
    fn input_schema_lists_required_fields() {
        let schema = chain_descriptor().input_schema();
        assert_eq!(schema["properties"]["depth"]["type"], "integer");
        assert_eq!(schema["required"], json!(["symbol", "expiry"]));
    }

    #[test]
    fn model_parameters_hide_derived_inputs() {
        let params = chain_descriptor().model_parameters();
        let props = params["properties"].as_object().expect("properties");
        assert_eq!(props.keys().collect::<Vec<_>>(), vec!["depth"]);
        assert_eq!(params["required"], json!([]));
    }

    #[test]
    fn model_description_includes_usage_guidance() {
        let text = chain_descriptor().model_description();
        assert!(text.starts_with("Fetch the option chain"));
        assert!(text.contains("Use when: after an expiry is known"));
        assert!(text.contains("Do not use when: when the trend is avoid"));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let raw = r#"
            name = "risk.trade.assess"
            category = "risk"

            [[inputs]]
            name = "plan"
            type = "object"
            required = true

            [dependencies]
            required_tools = ["analysis.plan.build"]
            forbidden_states = ["execution"]

            [produces]
            sized_plan = "$"
        "#;
        let descriptor: ToolDescriptor = toml::from_str(raw).expect("parse");
        assert_eq!(descriptor.inputs[0].kind, FieldType::Object);
        assert_eq!(
            descriptor.dependencies.forbidden_states,
            vec![Phase::Execution]
        );
        assert_eq!(descriptor.risk_level, RiskLevel::None);
        assert!(!descriptor.writes);
        assert!(descriptor.validate().is_empty());
    }
}
