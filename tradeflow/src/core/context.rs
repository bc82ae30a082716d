//! Run-scoped execution context.
//!
//! One [`ExecutionContext`] exists per run. It accumulates the latest value of
//! every logical key produced by tools, the ordered list of successful tool
//! calls, the active phase, per-tool correction counters and a trace. It is
//! passed by `&mut` to whoever mutates it; nothing about it outlives the run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::path::resolve_in;
use crate::core::types::Phase;

/// Kind of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    PhaseEntered,
    GuardEvaluated,
    ModelCall,
    ToolCalled,
    ToolFailed,
    CallsDiscarded,
    Correction,
    ForcedCall,
    FinalAnswer,
    KillSwitch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub phase: Phase,
    pub kind: TraceKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    values: Map<String, Value>,
    called: Vec<String>,
    phase: Phase,
    corrections: BTreeMap<String, u32>,
    trace: Vec<TraceEvent>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl ExecutionContext {
    /// Create a context seeded with caller-supplied values (market state,
    /// symbol, account flags).
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            values: initial,
            called: Vec::new(),
            phase: Phase::Precheck,
            corrections: BTreeMap::new(),
            trace: Vec::new(),
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Resolve a dotted context path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        resolve_in(&self.values, path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Overwrite the value for a logical key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Successful tool calls in call order.
    pub fn called_tools(&self) -> &[String] {
        &self.called
    }

    pub fn has_called(&self, tool: &str) -> bool {
        self.called.iter().any(|name| name == tool)
    }

    pub fn call_count(&self, tool: &str) -> u32 {
        self.called.iter().filter(|name| name.as_str() == tool).count() as u32
    }

    pub fn record_call(&mut self, tool: &str) {
        self.called.push(tool.to_string());
    }

    pub fn corrections(&self, tool: &str) -> u32 {
        self.corrections.get(tool).copied().unwrap_or(0)
    }

    /// Increment and return the correction counter for `tool`.
    pub fn bump_correction(&mut self, tool: &str) -> u32 {
        let counter = self.corrections.entry(tool.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_correction(&mut self, tool: &str) {
        self.corrections.remove(tool);
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    pub fn push_trace(&mut self, kind: TraceKind, detail: impl Into<String>) {
        self.trace.push(TraceEvent {
            phase: self.phase,
            kind,
            detail: detail.into(),
        });
    }

    /// Values as a JSON object, for guards and prompts.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> ExecutionContext {
        let initial = json!({"symbol": "NIFTY", "market_open": true})
            .as_object()
            .cloned()
            .expect("object");
        ExecutionContext::new(initial)
    }

    #[test]
    fn set_overwrites_previous_value() {
        let mut ctx = seeded();
        ctx.set("trend", json!("bullish"));
        ctx.set("trend", json!("avoid"));
        assert_eq!(ctx.get("trend"), Some(&json!("avoid")));
        assert_eq!(ctx.get("symbol"), Some(&json!("NIFTY")));
    }

    #[test]
    fn call_counts_follow_recorded_calls() {
        let mut ctx = seeded();
        ctx.record_call("market.trend.analyze");
        ctx.record_call("market.option.chain");
        ctx.record_call("market.trend.analyze");
        assert_eq!(ctx.call_count("market.trend.analyze"), 2);
        assert!(ctx.has_called("market.option.chain"));
        assert!(!ctx.has_called("execution.order.place"));
        assert_eq!(ctx.called_tools().len(), 3);
    }

    #[test]
    fn correction_counters_bump_and_reset_per_tool() {
        let mut ctx = seeded();
        assert_eq!(ctx.bump_correction("fetch_expiry_list"), 1);
        assert_eq!(ctx.bump_correction("fetch_expiry_list"), 2);
        assert_eq!(ctx.bump_correction("market.option.chain"), 1);
        ctx.reset_correction("fetch_expiry_list");
        assert_eq!(ctx.corrections("fetch_expiry_list"), 0);
        assert_eq!(ctx.corrections("market.option.chain"), 1);
    }

    #[test]
    fn trace_events_carry_current_phase() {
        let mut ctx = seeded();
        ctx.set_phase(Phase::Validation);
        ctx.push_trace(TraceKind::ToolCalled, "risk.trade.assess");
        assert_eq!(ctx.trace()[0].phase, Phase::Validation);
        assert_eq!(ctx.trace()[0].kind, TraceKind::ToolCalled);
    }
}
