//! Test-only helpers: a scripted model, fixture tool handlers for the
//! options workflow, and scratch directories.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::core::conversation::ToolCall;
use crate::core::types::FinalStatus;
use crate::error::HandlerError;
use crate::io::model::{ChatModel, ChatRequest, ModelReply};
use crate::pipeline::RunReport;
use crate::tools::ToolRegistry;
use crate::workflows::{
    EXPIRY_LIST, INSTRUMENT_RESOLVE, OPTION_CHAIN, ORDER_PLACE, PLAN_BUILD, POSITION_STATUS,
    TRADE_ASSESS, TREND_ANALYZE, builtin_descriptors,
};

/// Replays canned replies in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<ModelReply>>,
    repeat: Option<ModelReply>,
    requests: RefCell<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            ..Self::default()
        }
    }

    /// A model that answers every turn with the same reply.
    pub fn repeating(reply: ModelReply) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl ChatModel for ScriptedModel {
    fn complete(&self, request: &ChatRequest) -> Result<ModelReply> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(reply) = self.replies.borrow_mut().pop_front() {
            return Ok(reply);
        }
        self.repeat
            .clone()
            .ok_or_else(|| anyhow!("scripted model ran out of replies"))
    }
}

fn arguments(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn reply_call(name: &str, args: Value) -> ModelReply {
    ModelReply::calls(vec![ToolCall::new("", name, arguments(args))])
}

pub fn reply_calls(calls: Vec<(&str, Value)>) -> ModelReply {
    ModelReply::calls(
        calls
            .into_iter()
            .map(|(name, args)| ToolCall::new("", name, arguments(args)))
            .collect(),
    )
}

pub fn reply_text(text: &str) -> ModelReply {
    ModelReply::text(text)
}

/// Knobs for the fixture market.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFixture {
    pub trend: String,
    pub stop_loss: f64,
    pub approved: bool,
    pub order_type: String,
    /// The option chain service fails with an upstream error.
    pub chain_upstream_error: bool,
    /// The broker reports the order filled twice.
    pub duplicate_fill: bool,
}

impl Default for TradeFixture {
    fn default() -> Self {
        Self {
            trend: "bullish".to_string(),
            stop_loss: 71.5,
            approved: true,
            order_type: "LIMIT".to_string(),
            chain_upstream_error: false,
            duplicate_fill: false,
        }
    }
}

fn arg(args: &Map<String, Value>, key: &str) -> Value {
    args.get(key).cloned().unwrap_or(Value::Null)
}

/// Registry with every built-in tool bound to an in-process fixture handler.
pub fn fixture_registry(fixture: &TradeFixture) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for descriptor in builtin_descriptors() {
        let name = descriptor.name.clone();
        let fixture = fixture.clone();
        let descriptor = if name == ORDER_PLACE && fixture.duplicate_fill {
            descriptor.produce("duplicate_execution", "duplicate")
        } else {
            descriptor
        };
        let handler = move |args: &Map<String, Value>| fixture_call(&name, &fixture, args);
        registry
            .register(descriptor, handler)
            .expect("fixture descriptors are valid");
    }
    registry
}

fn fixture_call(
    tool: &str,
    fixture: &TradeFixture,
    args: &Map<String, Value>,
) -> Result<Value, HandlerError> {
    let entry = 95.25;
    match tool {
        INSTRUMENT_RESOLVE => Ok(json!({
            "symbol": arg(args, "symbol"),
            "lot_size": 75,
            "exchange": "NFO",
        })),
        TREND_ANALYZE => Ok(json!({
            "symbol": arg(args, "symbol"),
            "trend": fixture.trend,
            "spot": 22150.5,
            "strength": 0.72,
        })),
        EXPIRY_LIST => Ok(json!({
            "expiries": ["2024-06-27", "2024-07-04"],
            "nearest": "2024-06-27",
        })),
        OPTION_CHAIN => {
            if arg(args, "trend") == json!("avoid") {
                return Err(HandlerError::invalid_state("no chain for an avoid trend"));
            }
            if fixture.chain_upstream_error {
                return Err(HandlerError::upstream("option chain API returned 502"));
            }
            Ok(json!({
                "symbol": arg(args, "symbol"),
                "expiry": arg(args, "expiry"),
                "atm_strike": 22150,
                "strikes": [22100, 22150, 22200],
            }))
        }
        PLAN_BUILD => Ok(json!({
            "direction": fixture.trend,
            "strike": 22150,
            "option_type": "CE",
            "entry": entry,
            "stop_loss": fixture.stop_loss,
            "target": 140.0,
        })),
        TRADE_ASSESS => Ok(json!({
            "approved": fixture.approved,
            "score": 7,
            "sized_plan": {
                "direction": fixture.trend,
                "entry": entry,
                "stop_loss": fixture.stop_loss,
                "target": 140.0,
                "lots": 1,
                "quantity": 75,
                "lot_size": 75,
                "order_type": fixture.order_type,
            },
        })),
        ORDER_PLACE => Ok(json!({
            "order_id": "ORD-1",
            "status": "OPEN",
            "duplicate": fixture.duplicate_fill,
        })),
        POSITION_STATUS => Ok(json!({
            "order_id": arg(args, "order_id"),
            "quantity": 75,
            "average_price": entry,
            "pnl": 0.0,
        })),
        other => Err(HandlerError::internal(format!("no fixture for {other}"))),
    }
}

/// Context of a session that passes the global precheck.
pub fn analysis_ready_context() -> Map<String, Value> {
    arguments(json!({
        "symbol": "NIFTY",
        "market_open": true,
        "websocket_connected": true,
        "authenticated": true,
        "daily_loss": 0.0,
        "max_daily_loss": 5000.0,
    }))
}

/// Summary replies that close each phase.
pub fn phase_summaries() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("analysis", "Analysis complete: bullish trend, plan built at entry 95.25."),
        ("validation", "Risk assessment approved one lot."),
        ("execution", "Order ORD-1 is open."),
        ("position_tracking", "Position of 75 units is open with flat PnL."),
    ])
}

/// A fully compliant model script for a run through every phase.
pub fn happy_path_script() -> Vec<ModelReply> {
    let summaries = phase_summaries();
    vec![
        reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
        reply_call(TREND_ANALYZE, json!({})),
        reply_call(EXPIRY_LIST, json!({})),
        reply_call(OPTION_CHAIN, json!({})),
        reply_call(PLAN_BUILD, json!({})),
        reply_text(summaries["analysis"]),
        reply_call(TRADE_ASSESS, json!({})),
        reply_text(summaries["validation"]),
        reply_call(ORDER_PLACE, json!({})),
        reply_text(summaries["execution"]),
        reply_call(POSITION_STATUS, json!({})),
        reply_text(summaries["position_tracking"]),
    ]
}

/// A completed report with no trace, for serialization tests.
pub fn sample_report(run_id: &str) -> RunReport {
    let mut report = RunReport::new(run_id, 40, false);
    report.final_status = FinalStatus::Completed;
    report.final_output = "Position of 75 units is open with flat PnL.".to_string();
    report.reason = "all phases passed".to_string();
    report
}

/// Temporary directory for files handed to the CLI.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create scratch dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_json(&self, name: &str, value: &Value) -> Result<PathBuf> {
        let raw = serde_json::to_string_pretty(value).context("serialize fixture")?;
        self.write_text(name, &raw)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
