//! Built-in tool contracts and phase workflows for the options pipeline.
//!
//! Handlers are not provided here: they are external collaborators bound
//! through a tool manifest (or fixtures in tests).

use std::collections::BTreeMap;

use serde_json::json;

use crate::core::descriptor::{FieldType, ToolDescriptor};
use crate::core::types::{Phase, RiskLevel};
use crate::core::workflow::Workflow;

pub const INSTRUMENT_RESOLVE: &str = "market.instrument.resolve";
pub const TREND_ANALYZE: &str = "market.trend.analyze";
pub const EXPIRY_LIST: &str = "market.option.expiry_list";
pub const OPTION_CHAIN: &str = "market.option.chain";
pub const PLAN_BUILD: &str = "analysis.plan.build";
pub const TRADE_ASSESS: &str = "risk.trade.assess";
pub const ORDER_PLACE: &str = "execution.order.place";
pub const POSITION_STATUS: &str = "execution.position.status";

pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(INSTRUMENT_RESOLVE, "market_data")
            .describe("Resolve a trading symbol to its instrument record and lot size.")
            .usage("first, before any market data is fetched", "once the instrument is known")
            .input("symbol", FieldType::String, true)
            .output("symbol", FieldType::String, true)
            .output("lot_size", FieldType::Integer, true)
            .forbid_in(Phase::Execution)
            .produce("instrument", "$")
            .produce("lot_size", "lot_size")
            .risk(RiskLevel::None),
        ToolDescriptor::new(TREND_ANALYZE, "market_data")
            .describe("Classify the current trend of the underlying.")
            .usage("after the instrument is resolved", "to re-check a trend already analysed")
            .input("symbol", FieldType::String, true)
            .output("trend", FieldType::String, true)
            .derive_input("symbol", "instrument.symbol")
            .requires_tool(INSTRUMENT_RESOLVE)
            .forbid_in(Phase::Execution)
            .produce("trend", "trend")
            .produce("trend_analysis", "$"),
        ToolDescriptor::new(EXPIRY_LIST, "market_data")
            .describe("List option expiries for the underlying, nearest first.")
            .usage("after the trend is known", "when the trend is avoid")
            .input("symbol", FieldType::String, true)
            .output("expiries", FieldType::Array, true)
            .output("nearest", FieldType::String, true)
            .derive_input("symbol", "instrument.symbol")
            .requires_tool(TREND_ANALYZE)
            .forbid_in(Phase::Execution)
            .produce("expiries", "expiries")
            .produce("expiry", "nearest"),
        ToolDescriptor::new(OPTION_CHAIN, "market_data")
            .describe("Fetch the option chain for one expiry around the money.")
            .usage("after an expiry is selected", "when the trend is avoid")
            .input("symbol", FieldType::String, true)
            .input("expiry", FieldType::String, true)
            .input("trend", FieldType::String, true)
            .input("depth", FieldType::Integer, false)
            .output("atm_strike", FieldType::Number, true)
            .derive_input("symbol", "instrument.symbol")
            .derive_input("expiry", "expiry")
            .derive_input("trend", "trend")
            .requires_tool(EXPIRY_LIST)
            .requires_output("expiry")
            .forbid_in(Phase::Execution)
            .produce("option_chain", "$"),
        ToolDescriptor::new(PLAN_BUILD, "analysis")
            .describe("Build a trade plan (strike, entry, stop loss, target) from the chain.")
            .usage("after the option chain is fetched", "before the chain is available")
            .input("trend", FieldType::String, true)
            .input("option_chain", FieldType::Object, true)
            .output("direction", FieldType::String, true)
            .output("entry", FieldType::Number, true)
            .output("stop_loss", FieldType::Number, true)
            .output("target", FieldType::Number, true)
            .derive_input("trend", "trend")
            .derive_input("option_chain", "option_chain")
            .requires_tool(OPTION_CHAIN)
            .forbid_in(Phase::Execution)
            .produce("plan", "$")
            .safety_rule("stop loss must sit on the losing side of entry"),
        ToolDescriptor::new(TRADE_ASSESS, "risk")
            .describe("Score the plan and size it in whole lots.")
            .usage("once a plan exists", "to change a plan's levels")
            .input("plan", FieldType::Object, true)
            .input("lot_size", FieldType::Integer, true)
            .input("capital", FieldType::Number, false)
            .output("approved", FieldType::Boolean, true)
            .output("sized_plan", FieldType::Object, true)
            .derive_input("plan", "plan")
            .derive_input("lot_size", "lot_size")
            .requires_tool(PLAN_BUILD)
            .requires_output("plan")
            .forbid_in(Phase::Execution)
            .produce("approval", "approved")
            .produce("sized_plan", "sized_plan")
            .produce("trade_score", "score")
            .risk(RiskLevel::Low),
        ToolDescriptor::new(ORDER_PLACE, "execution")
            .describe("Place the approved order with the broker.")
            .usage("once, after the plan is approved", "without an approval or to retry a sent order")
            .input("plan", FieldType::Object, true)
            .output("order_id", FieldType::String, true)
            .derive_input("plan", "sized_plan")
            .requires_tool(TRADE_ASSESS)
            .requires_output("approval")
            .forbid_in(Phase::Precheck)
            .forbid_in(Phase::Analysis)
            .forbid_in(Phase::Validation)
            .max_calls(1)
            .produce("order", "$")
            .safety_rule("never place more than one order per trade")
            .safety_rule("quantity is taken from the sized plan, never from the model")
            .risk(RiskLevel::High)
            .writes(),
        ToolDescriptor::new(POSITION_STATUS, "execution")
            .describe("Report the broker position created by the order.")
            .usage("after the order is placed", "before an order exists")
            .input("order_id", FieldType::String, true)
            .derive_input("order_id", "order.order_id")
            .requires_tool(ORDER_PLACE)
            .requires_output("order.order_id")
            .produce("position", "$"),
    ]
}

pub fn builtin_descriptor(name: &str) -> Option<ToolDescriptor> {
    builtin_descriptors()
        .into_iter()
        .find(|descriptor| descriptor.name == name)
}

/// Workflows per phase. Precheck has none: it is pure checklist.
pub fn default_workflows() -> BTreeMap<Phase, Workflow> {
    BTreeMap::from([
        (
            Phase::Analysis,
            Workflow::new("analysis")
                .step(INSTRUMENT_RESOLVE)
                .step(TREND_ANALYZE)
                .step(EXPIRY_LIST)
                .step(OPTION_CHAIN)
                .step(PLAN_BUILD)
                .skip_when(
                    "trend",
                    vec![json!("avoid")],
                    &[EXPIRY_LIST, OPTION_CHAIN, PLAN_BUILD],
                    "trend is avoid; no trade to plan",
                )
                .terminal(PLAN_BUILD),
        ),
        (Phase::Validation, Workflow::new("validation").step(TRADE_ASSESS)),
        (Phase::Execution, Workflow::new("execution").step(ORDER_PLACE)),
        (
            Phase::PositionTracking,
            Workflow::new("position_tracking").step(POSITION_STATUS),
        ),
    ])
}
