//! Declarative checklist rules and their evaluation.
//!
//! Rules are data: each names a field path inside a JSON snapshot and a
//! predicate over it. Evaluation is pure and returns a fresh [`GuardResult`].
//! The rule set is owned by configuration (see `io::checklist_config`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::path::{is_valid_path, resolve};
use crate::core::types::{GuardAction, GuardFailure, GuardResult, Phase};

/// Right-hand side of a comparison: another field or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Field { field: String },
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, snapshot: &'a Value) -> Option<&'a Value> {
        match self {
            Operand::Field { field } => resolve(snapshot, field),
            Operand::Literal(value) => Some(value),
        }
    }

    fn label(&self) -> String {
        match self {
            Operand::Field { field } => field.clone(),
            Operand::Literal(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Present { field: String },
    Absent { field: String },
    AllPresent { fields: Vec<String> },
    Equals { field: String, value: Operand },
    NotEquals { field: String, value: Operand },
    OneOf { field: String, values: Vec<Value> },
    NotOneOf { field: String, values: Vec<Value> },
    Min { field: String, min: f64 },
    Max { field: String, max: f64 },
    Between { field: String, min: f64, max: f64 },
    /// `|field - reference| / |reference|` as a percentage must not exceed `max_pct`.
    MaxPercentFrom {
        field: String,
        reference: String,
        max_pct: f64,
    },
    MultipleOf { field: String, unit: Operand },
}

impl Condition {
    /// Field paths the condition reads.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Condition::AllPresent { fields } => fields.iter().map(String::as_str).collect(),
            Condition::MaxPercentFrom {
                field, reference, ..
            } => vec![field, reference],
            Condition::Equals { field, value } | Condition::NotEquals { field, value } => {
                let mut fields = vec![field.as_str()];
                if let Operand::Field { field } = value {
                    fields.push(field);
                }
                fields
            }
            Condition::MultipleOf { field, unit } => {
                let mut fields = vec![field.as_str()];
                if let Operand::Field { field } = unit {
                    fields.push(field);
                }
                fields
            }
            Condition::Present { field }
            | Condition::Absent { field }
            | Condition::OneOf { field, .. }
            | Condition::NotOneOf { field, .. }
            | Condition::Min { field, .. }
            | Condition::Max { field, .. }
            | Condition::Between { field, .. } => vec![field],
        }
    }

    /// `Ok` when the predicate holds, otherwise a detail naming the values.
    pub fn check(&self, snapshot: &Value) -> Result<(), String> {
        match self {
            Condition::Present { field } => match resolve(snapshot, field) {
                Some(_) => Ok(()),
                None => Err(format!("`{field}` is missing")),
            },
            Condition::Absent { field } => match resolve(snapshot, field) {
                // `false` counts as absent for flags like `pending_order`.
                None | Some(Value::Bool(false)) => Ok(()),
                Some(value) => Err(format!("`{field}` is set ({value})")),
            },
            Condition::AllPresent { fields } => {
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|field| resolve(snapshot, field).is_none())
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing fields: {}", missing.join(", ")))
                }
            }
            Condition::Equals { field, value } => {
                let actual = lookup(snapshot, field)?;
                let expected = value
                    .resolve(snapshot)
                    .ok_or_else(|| format!("`{}` is missing", value.label()))?;
                if values_equal(actual, expected) {
                    Ok(())
                } else {
                    Err(format!("`{field}` is {actual}, expected {expected}"))
                }
            }
            Condition::NotEquals { field, value } => {
                let Some(actual) = resolve(snapshot, field) else {
                    return Ok(());
                };
                match value.resolve(snapshot) {
                    Some(expected) if values_equal(actual, expected) => {
                        Err(format!("`{field}` must not be {expected}"))
                    }
                    _ => Ok(()),
                }
            }
            Condition::OneOf { field, values } => {
                let actual = lookup(snapshot, field)?;
                if values.iter().any(|allowed| values_equal(actual, allowed)) {
                    Ok(())
                } else {
                    Err(format!(
                        "`{field}` is {actual}, expected one of {}",
                        Value::Array(values.clone())
                    ))
                }
            }
            Condition::NotOneOf { field, values } => match resolve(snapshot, field) {
                Some(actual) if values.iter().any(|denied| values_equal(actual, denied)) => {
                    Err(format!("`{field}` is {actual}, which is not allowed"))
                }
                _ => Ok(()),
            },
            Condition::Min { field, min } => {
                let actual = number_at(snapshot, field)?;
                if actual >= *min {
                    Ok(())
                } else {
                    Err(format!("`{field}` {actual} is below min {min}"))
                }
            }
            Condition::Max { field, max } => {
                let actual = number_at(snapshot, field)?;
                if actual <= *max {
                    Ok(())
                } else {
                    Err(format!("`{field}` {actual} exceeds max {max}"))
                }
            }
            Condition::Between { field, min, max } => {
                let actual = number_at(snapshot, field)?;
                if actual >= *min && actual <= *max {
                    Ok(())
                } else {
                    Err(format!("`{field}` {actual} is outside [{min}, {max}]"))
                }
            }
            Condition::MaxPercentFrom {
                field,
                reference,
                max_pct,
            } => {
                let actual = number_at(snapshot, field)?;
                let base = number_at(snapshot, reference)?;
                if base == 0.0 {
                    return Err(format!("`{reference}` must be non-zero"));
                }
                let pct = (actual - base).abs() / base.abs() * 100.0;
                if pct <= *max_pct {
                    Ok(())
                } else {
                    Err(format!(
                        "{field} {actual:.2} is {pct:.2}% from {reference} {base:.2}, exceeds max {max_pct:.2}%"
                    ))
                }
            }
            Condition::MultipleOf { field, unit } => {
                let actual = number_at(snapshot, field)?;
                let unit_value = unit
                    .resolve(snapshot)
                    .and_then(as_number)
                    .ok_or_else(|| format!("`{}` is not a number", unit.label()))?;
                if unit_value <= 0.0 {
                    return Err(format!("`{}` must be positive", unit.label()));
                }
                let ratio = actual / unit_value;
                if (ratio - ratio.round()).abs() < 1e-9 {
                    Ok(())
                } else {
                    Err(format!(
                        "`{field}` {actual} is not a multiple of {} {unit_value}",
                        unit.label()
                    ))
                }
            }
        }
    }
}

fn lookup<'a>(snapshot: &'a Value, field: &str) -> Result<&'a Value, String> {
    resolve(snapshot, field).ok_or_else(|| format!("`{field}` is missing"))
}

fn number_at(snapshot: &Value, field: &str) -> Result<f64, String> {
    let value = lookup(snapshot, field)?;
    as_number(value).ok_or_else(|| format!("`{field}` is not a number ({value})"))
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str()?.trim().parse::<f64>().ok())
}

/// Numbers compare by value (`1` equals `1.0`); strings case-insensitively.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left.as_f64() == right.as_f64(),
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        _ => left == right,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    /// Overrides the phase action when this rule fails. `continue` makes the
    /// rule advisory: reported, but never blocking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<GuardAction>,
    #[serde(flatten)]
    pub condition: Condition,
}

impl Rule {
    pub fn new(id: impl Into<String>, description: impl Into<String>, condition: Condition) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            action: None,
            condition,
        }
    }

    pub fn with_action(mut self, action: GuardAction) -> Self {
        self.action = Some(action);
        self
    }

    fn is_advisory(&self) -> bool {
        self.action == Some(GuardAction::Continue)
    }
}

/// Evaluate every rule against `snapshot`.
///
/// The result action is the most severe action among failing blocking rules.
pub fn evaluate_rules(rules: &[Rule], snapshot: &Value, default_action: GuardAction) -> GuardResult {
    let mut failures = Vec::new();
    let mut action: Option<GuardAction> = None;

    for rule in rules {
        let Err(detail) = rule.condition.check(snapshot) else {
            continue;
        };
        failures.push(GuardFailure {
            rule_id: rule.id.clone(),
            description: format!("{}: {detail}", rule.description),
        });
        if rule.is_advisory() {
            continue;
        }
        let rule_action = rule.action.unwrap_or(default_action);
        if action.is_none_or(|current| rule_action.severity() > current.severity()) {
            action = Some(rule_action);
        }
    }

    match action {
        Some(action) => GuardResult::fail(failures, action),
        None => GuardResult {
            passed: true,
            failures,
            action: GuardAction::Continue,
        },
    }
}

/// Rules for one phase, with optional sub-mode extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseChecklist {
    /// Action for failing rules that name none. Defaults per phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<GuardAction>,
    /// Context key whose object fields are lifted to the top of the snapshot
    /// (e.g. `sized_plan`, so rules can say `stop_loss` instead of
    /// `sized_plan.stop_loss`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub rules: Vec<Rule>,
    /// Mode name -> extra rules. A mode rule replaces a base rule with the
    /// same id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modes: BTreeMap<String, Vec<Rule>>,
}

impl PhaseChecklist {
    pub fn action_for(&self, phase: Phase) -> GuardAction {
        self.action.unwrap_or_else(|| phase.default_guard_action())
    }

    /// Base rules merged with the rules of `mode`.
    pub fn rules_for(&self, mode: Option<&str>) -> Vec<Rule> {
        let mut rules = self.rules.clone();
        let Some(extra) = mode.and_then(|mode| self.modes.get(mode)) else {
            return rules;
        };
        for rule in extra {
            match rules.iter_mut().find(|existing| existing.id == rule.id) {
                Some(existing) => *existing = rule.clone(),
                None => rules.push(rule.clone()),
            }
        }
        rules
    }

    /// Build the snapshot the rules see from raw context values.
    pub fn snapshot(&self, values: &Map<String, Value>) -> Value {
        let mut merged = values.clone();
        if let Some(Value::Object(fields)) = self
            .subject
            .as_deref()
            .and_then(|subject| crate::core::path::resolve_in(values, subject))
        {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }
}

/// The complete checklist rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checklist {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<String>,
    pub phases: BTreeMap<Phase, PhaseChecklist>,
}

impl Checklist {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseChecklist> {
        self.phases.get(&phase)
    }

    /// Evaluate the checklist of `phase`. Phases without rules pass.
    pub fn evaluate(&self, phase: Phase, values: &Map<String, Value>, mode: Option<&str>) -> GuardResult {
        let Some(checklist) = self.phase(phase) else {
            return GuardResult::pass();
        };
        let mode = mode.or(self.default_mode.as_deref());
        evaluate_rules(
            &checklist.rules_for(mode),
            &checklist.snapshot(values),
            checklist.action_for(phase),
        )
    }

    /// Every mode name mentioned by any phase.
    pub fn modes(&self) -> BTreeSet<&str> {
        self.phases
            .values()
            .flat_map(|checklist| checklist.modes.keys().map(String::as_str))
            .collect()
    }

    /// Structural problems (empty on success).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(mode) = &self.default_mode
            && !self.modes().contains(mode.as_str())
        {
            errors.push(format!("default_mode '{mode}' is not defined by any phase"));
        }
        for (phase, checklist) in &self.phases {
            let mut all = vec![("", &checklist.rules)];
            all.extend(
                checklist
                    .modes
                    .iter()
                    .map(|(mode, rules)| (mode.as_str(), rules)),
            );
            for (mode, rules) in all {
                let scope = if mode.is_empty() {
                    phase.to_string()
                } else {
                    format!("{phase}.{mode}")
                };
                let mut seen = BTreeSet::new();
                for rule in rules {
                    validate_rule(&scope, rule, &mut seen, &mut errors);
                }
            }
        }
        errors
    }
}

fn validate_rule<'a>(scope: &str, rule: &'a Rule, seen: &mut BTreeSet<&'a str>, errors: &mut Vec<String>) {
    if rule.id.trim().is_empty() {
        errors.push(format!("{scope}: rule id must not be empty"));
    } else if !seen.insert(rule.id.as_str()) {
        errors.push(format!("{scope}: duplicate rule id '{}'", rule.id));
    }
    if rule.description.trim().is_empty() {
        errors.push(format!("{scope}: rule '{}' has no description", rule.id));
    }
    let fields = rule.condition.fields();
    if fields.is_empty() {
        errors.push(format!("{scope}: rule '{}' reads no fields", rule.id));
    }
    for field in fields {
        if !is_valid_path(field) {
            errors.push(format!(
                "{scope}: rule '{}' has invalid field path '{field}'",
                rule.id
            ));
        }
    }
    if let Condition::Between { min, max, .. } = rule.condition
        && min > max
    {
        errors.push(format!("{scope}: rule '{}' has min > max", rule.id));
    }
}
