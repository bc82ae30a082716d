//! Precondition checks evaluated before any tool invocation.
//!
//! A tool may only run if the current phase is not forbidden, every required
//! tool has already been called, every required output and derived input
//! resolves in the context, and the call limit has not been reached.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::context::ExecutionContext;
use crate::core::descriptor::ToolDescriptor;
use crate::core::types::Phase;

/// The first unmet dependency of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Unmet {
    ForbiddenState { phase: Phase },
    MissingTool { tool: String },
    MissingOutput { path: String },
    MissingDerivedInput { input: String, path: String },
    CallLimit { limit: u32, calls: u32 },
}

impl fmt::Display for Unmet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unmet::ForbiddenState { phase } => {
                write!(f, "tool may not be called during the {phase} phase")
            }
            Unmet::MissingTool { tool } => write!(f, "`{tool}` must be called first"),
            Unmet::MissingOutput { path } => {
                write!(f, "required value `{path}` is not available yet")
            }
            Unmet::MissingDerivedInput { input, path } => write!(
                f,
                "input `{input}` is taken from `{path}`, which is not available yet"
            ),
            Unmet::CallLimit { limit, calls } => {
                write!(f, "call limit reached ({calls} of {limit} calls used)")
            }
        }
    }
}

/// Return the first unmet precondition, checking in a fixed order.
pub fn check_preconditions(descriptor: &ToolDescriptor, ctx: &ExecutionContext) -> Result<(), Unmet> {
    match unmet_preconditions(descriptor, ctx).into_iter().next() {
        Some(unmet) => Err(unmet),
        None => Ok(()),
    }
}

/// Every unmet precondition (empty when the tool may run).
pub fn unmet_preconditions(descriptor: &ToolDescriptor, ctx: &ExecutionContext) -> Vec<Unmet> {
    let deps = &descriptor.dependencies;
    let mut unmet = Vec::new();

    if deps.forbidden_states.contains(&ctx.phase()) {
        unmet.push(Unmet::ForbiddenState { phase: ctx.phase() });
    }

    for tool in &deps.required_tools {
        if !ctx.has_called(tool) {
            unmet.push(Unmet::MissingTool { tool: tool.clone() });
        }
    }

    for path in &deps.required_outputs {
        if !ctx.contains(path) {
            unmet.push(Unmet::MissingOutput { path: path.clone() });
        }
    }

    for (input, path) in &deps.derived_inputs {
        if !ctx.contains(path) {
            unmet.push(Unmet::MissingDerivedInput {
                input: input.clone(),
                path: path.clone(),
            });
        }
    }

    if let Some(limit) = deps.max_calls_per_trade {
        let calls = ctx.call_count(&descriptor.name);
        if calls >= limit {
            unmet.push(Unmet::CallLimit { limit, calls });
        }
    }

    unmet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::FieldType;
    use serde_json::json;

    fn order_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("execution.order.place", "execution")
            .input("plan", FieldType::Object, true)
            .requires_tool("risk.trade.assess")
            .requires_output("approval")
            .derive_input("plan", "sized_plan")
            .forbid_in(Phase::Analysis)
            .max_calls(1)
    }

    fn ready_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.set_phase(Phase::Execution);
        ctx.record_call("risk.trade.assess");
        ctx.set("approval", json!(true));
        ctx.set("sized_plan", json!({"lots": 1}));
        ctx
    }

    #[test]
    fn ready_context_satisfies_all_preconditions() {
        assert_eq!(check_preconditions(&order_descriptor(), &ready_context()), Ok(()));
    }

    #[test]
    fn forbidden_state_is_checked_first() {
        let mut ctx = ExecutionContext::default();
        ctx.set_phase(Phase::Analysis);
        let err = check_preconditions(&order_descriptor(), &ctx).expect_err("forbidden");
        assert_eq!(err, Unmet::ForbiddenState { phase: Phase::Analysis });
        assert_eq!(unmet_preconditions(&order_descriptor(), &ctx).len(), 4);
    }

    #[test]
    fn missing_required_tool_is_named() {
        let mut ctx = ExecutionContext::new(ready_context().values().clone());
        ctx.set_phase(Phase::Execution);
        let err = check_preconditions(&order_descriptor(), &ctx).expect_err("missing tool");
        assert_eq!(
            err,
            Unmet::MissingTool {
                tool: "risk.trade.assess".to_string()
            }
        );
        assert!(err.to_string().contains("`risk.trade.assess` must be called first"));
    }

    #[test]
    fn null_output_does_not_satisfy_dependency() {
        let mut ctx = ready_context();
        ctx.set("approval", serde_json::Value::Null);
        let err = check_preconditions(&order_descriptor(), &ctx).expect_err("missing output");
        assert_eq!(
            err,
            Unmet::MissingOutput {
                path: "approval".to_string()
            }
        );
    }

    #[test]
    fn unresolvable_derived_input_is_unmet() {
        let mut ctx = ready_context();
        ctx.set("sized_plan", serde_json::Value::Null);
        let err = check_preconditions(&order_descriptor(), &ctx).expect_err("derived");
        assert!(matches!(err, Unmet::MissingDerivedInput { ref input, .. } if input == "plan"));
    }

    #[test]
    fn call_limit_blocks_second_call() {
        let mut ctx = ready_context();
        ctx.record_call("execution.order.place");
        let err = check_preconditions(&order_descriptor(), &ctx).expect_err("limit");
        assert_eq!(err, Unmet::CallLimit { limit: 1, calls: 1 });
    }
}
