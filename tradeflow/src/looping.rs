//! Agent loop for one phase.
//!
//! Each step is one model turn (or one host-forced tool call). The loop owns
//! the conversation for the phase: it opens the phase, rebuilds the system
//! prompt from the context every turn, executes at most one proposed tool call
//! per turn, sends a corrective turn for every non-compliant reply, and calls
//! the next required tool itself once that tool's correction counter reaches
//! the threshold.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CallBudget;
use crate::core::classifier::{TextClass, classify_response};
use crate::core::context::{ExecutionContext, TraceKind};
use crate::core::conversation::{Conversation, Message, ToolCall};
use crate::core::workflow::{Workflow, WorkflowStep};
use crate::error::{RunError, ToolError};
use crate::io::config::TradeflowConfig;
use crate::io::model::{ChatModel, ChatRequest};
use crate::io::prompt::{
    Correction, CorrectionReason, PromptBuilder, StepView, SystemPromptInputs, render_correction,
    render_phase_start,
};
use crate::tools::{ToolOutcome, ToolRegistry};

/// Correction counter used once every required tool has run but the model
/// still does not give a plain final answer.
pub const FINAL_ANSWER_KEY: &str = "<final_answer>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_steps: u32,
    pub correction_threshold: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 24,
            correction_threshold: 3,
        }
    }
}

impl From<&TradeflowConfig> for LoopConfig {
    fn from(config: &TradeflowConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            correction_threshold: config.correction_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopRequest<'a> {
    pub task: &'a str,
    pub workflow: &'a Workflow,
    pub mode: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub final_output: String,
    /// Model turns plus forced calls.
    pub iterations: u32,
    pub forced_calls: u32,
}

pub struct AgentLoop<'a, M: ChatModel> {
    registry: &'a ToolRegistry,
    model: &'a M,
    prompts: PromptBuilder,
    config: LoopConfig,
}

impl<'a, M: ChatModel> AgentLoop<'a, M> {
    pub fn new(registry: &'a ToolRegistry, model: &'a M, config: LoopConfig) -> Self {
        Self {
            registry,
            model,
            prompts: PromptBuilder::default(),
            config,
        }
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Drive the phase in `ctx.phase()` until the model gives a final answer.
    ///
    /// `kill_check` runs after every tool execution; returning a reason ends
    /// the loop with [`RunError::KillSwitchTriggered`].
    #[instrument(skip_all, fields(phase = %ctx.phase(), workflow = %request.workflow.name))]
    pub fn run<K>(
        &self,
        request: &LoopRequest<'_>,
        ctx: &mut ExecutionContext,
        conversation: &mut Conversation,
        budget: &mut CallBudget,
        mut kill_check: K,
    ) -> Result<LoopOutcome, RunError>
    where
        K: FnMut(&ExecutionContext) -> Option<String>,
    {
        let phase = ctx.phase();
        let workflow = request.workflow;
        let threshold = self.config.correction_threshold;

        let opening = render_phase_start(
            request.task,
            phase,
            workflow.next_required(ctx).map(|step| step.tool.as_str()),
        )
        .map_err(|source| RunError::Model { phase, source })?;
        conversation.push(Message::user(opening));

        let mut iterations = 0u32;
        let mut forced_calls = 0u32;
        for step in 1..=self.config.max_steps {
            match workflow.next_required(ctx) {
                Some(next) if ctx.corrections(&next.tool) >= threshold => {
                    iterations += 1;
                    forced_calls += 1;
                    self.force_call(workflow, next, forced_calls, ctx, conversation)?;
                    if let Some(reason) = kill_check(ctx) {
                        return Err(RunError::KillSwitchTriggered { phase, reason });
                    }
                    continue;
                }
                None if ctx.corrections(FINAL_ANSWER_KEY) >= threshold => {
                    ctx.reset_correction(FINAL_ANSWER_KEY);
                    ctx.push_trace(
                        TraceKind::FinalAnswer,
                        "host closed the phase after repeated non-final replies",
                    );
                    warn!(step, "closing phase without a model summary");
                    return Ok(LoopOutcome {
                        final_output: format!("{phase} workflow complete"),
                        iterations,
                        forced_calls,
                    });
                }
                _ => {}
            }

            if !budget.consume() {
                return Err(RunError::LlmBudgetExhausted {
                    phase,
                    limit: budget.limit(),
                });
            }
            let chat = self
                .build_request(request, ctx, conversation)
                .map_err(|source| RunError::Model { phase, source })?;
            let reply = self
                .model
                .complete(&chat)
                .map_err(|source| RunError::Model { phase, source })?;
            iterations += 1;
            ctx.push_trace(
                TraceKind::ModelCall,
                format!("step {step}: {} tool call(s)", reply.tool_calls.len()),
            );

            let Some(first) = reply.tool_calls.first() else {
                let text = reply.content_str().trim().to_string();
                let class = classify_response(&text, workflow.is_complete(ctx));
                debug!(step, class = class.as_str(), "text reply");
                conversation.push(Message::assistant(text.clone()));
                let reason = match class {
                    TextClass::Final => {
                        ctx.reset_correction(FINAL_ANSWER_KEY);
                        ctx.push_trace(TraceKind::FinalAnswer, text.clone());
                        info!(step, iterations, forced_calls, "phase converged");
                        return Ok(LoopOutcome {
                            final_output: text,
                            iterations,
                            forced_calls,
                        });
                    }
                    TextClass::CodeLike => CorrectionReason::CodeLike,
                    TextClass::StatedIntent => CorrectionReason::StatedIntent,
                    TextClass::Incomplete => CorrectionReason::Incomplete,
                };
                let correction = self.correction_for(reason, workflow, ctx);
                self.send_correction(correction, ctx, conversation)?;
                continue;
            };

            let proposed = reply.tool_calls.len();
            let mut call = first.clone();
            if call.id.is_empty() {
                call.id = format!("call-{step}");
            }
            conversation.push(Message::assistant_tool_call(reply.content_str(), call.clone()));
            if proposed > 1 {
                warn!(step, proposed, executed = %call.name, "discarding extra tool calls");
                ctx.push_trace(
                    TraceKind::CallsDiscarded,
                    format!("executed `{}`, discarded {}", call.name, proposed - 1),
                );
            }

            if !workflow.contains(&call.name) {
                let refusal = json!({
                    "status": "error",
                    "error": {
                        "kind": "not_offered",
                        "message": format!("`{}` is not available in the {phase} phase", call.name),
                        "recoverable": true,
                    },
                });
                conversation.push(Message::tool_result(&call, refusal.to_string()));
                ctx.push_trace(TraceKind::ToolFailed, format!("{}: not offered", call.name));
                let mut correction = self.correction_for(CorrectionReason::NotOffered, workflow, ctx);
                correction.offered_tool = Some(call.name.as_str());
                correction.proposed = proposed;
                correction.executed = Some(call.name.as_str());
                self.send_correction(correction, ctx, conversation)?;
                continue;
            }

            let outcome = self.registry.call(&call.name, &call.arguments, ctx);
            conversation.push(Message::tool_result(&call, outcome.to_json().to_string()));
            match outcome {
                ToolOutcome::Success(_) => {
                    ctx.reset_correction(&call.name);
                    ctx.push_trace(TraceKind::ToolCalled, call.name.clone());
                    if proposed > 1 {
                        let mut correction =
                            self.correction_for(CorrectionReason::Serial, workflow, ctx);
                        correction.proposed = proposed;
                        correction.executed = Some(call.name.as_str());
                        self.send_correction(correction, ctx, conversation)?;
                    }
                }
                ToolOutcome::Error(err) if err.is_recoverable() => {
                    ctx.push_trace(TraceKind::ToolFailed, format!("{}: {err}", call.name));
                    let mut correction =
                        self.correction_for(CorrectionReason::ToolError, workflow, ctx);
                    correction.detail = Some(err.to_string());
                    correction.proposed = proposed;
                    correction.executed = Some(call.name.as_str());
                    self.send_correction(correction, ctx, conversation)?;
                }
                ToolOutcome::Error(err) => {
                    ctx.push_trace(TraceKind::ToolFailed, format!("{}: {err}", call.name));
                    return Err(RunError::Tool(err));
                }
            }

            if let Some(reason) = kill_check(ctx) {
                return Err(RunError::KillSwitchTriggered { phase, reason });
            }
        }

        let pending = workflow
            .next_required(ctx)
            .map(|step| step.tool.clone())
            .unwrap_or_else(|| "final answer".to_string());
        warn!(max_steps = self.config.max_steps, pending = %pending, "no convergence");
        Err(RunError::NonConvergence {
            phase,
            steps: self.config.max_steps,
            pending,
        })
    }

    fn build_request(
        &self,
        request: &LoopRequest<'_>,
        ctx: &ExecutionContext,
        conversation: &Conversation,
    ) -> anyhow::Result<ChatRequest> {
        let workflow = request.workflow;
        let next = workflow.next_required(ctx).map(|step| step.tool.as_str());
        let skipped = workflow.skipped_tools(ctx);
        let steps = workflow
            .steps
            .iter()
            .map(|step| StepView {
                tool: step.tool.clone(),
                state: if ctx.has_called(&step.tool) {
                    "done"
                } else if skipped.contains(&step.tool) {
                    "skipped"
                } else if next == Some(step.tool.as_str()) {
                    "next"
                } else {
                    "pending"
                },
            })
            .collect();
        let system = self.prompts.build_system(&SystemPromptInputs {
            task: request.task,
            phase: ctx.phase(),
            mode: request.mode,
            next_tool: next,
            steps,
            context: ctx.values(),
        })?;
        Ok(ChatRequest {
            system,
            messages: conversation.messages().to_vec(),
            tools: self.registry.schemas_for(workflow.tools()),
        })
    }

    /// A correction naming the next required tool and the values the host
    /// will use for it.
    fn correction_for<'w>(
        &self,
        reason: CorrectionReason,
        workflow: &'w Workflow,
        ctx: &ExecutionContext,
    ) -> Correction<'w> {
        let next = workflow.next_required(ctx);
        let mut correction = Correction::new(reason, ctx.phase(), next.map(|step| step.tool.as_str()));
        if let Some(step) = next
            && let Some(descriptor) = self.registry.descriptor(&step.tool)
        {
            correction.values = workflow.concrete_values(step, descriptor, ctx);
        }
        correction
    }

    /// Count (except for serial-call reminders), render and append a
    /// corrective user turn.
    fn send_correction(
        &self,
        mut correction: Correction<'_>,
        ctx: &mut ExecutionContext,
        conversation: &mut Conversation,
    ) -> Result<(), RunError> {
        let key = correction.tool.unwrap_or(FINAL_ANSWER_KEY);
        if correction.reason != CorrectionReason::Serial {
            correction.attempt = ctx.bump_correction(key);
            correction.threshold = self.config.correction_threshold;
        }
        let phase = ctx.phase();
        let text =
            render_correction(&correction).map_err(|source| RunError::Model { phase, source })?;
        debug!(
            reason = correction.reason.as_str(),
            tool = key,
            counter = correction.attempt,
            "corrective turn"
        );
        ctx.push_trace(
            TraceKind::Correction,
            format!("{} -> {key} ({})", correction.reason.as_str(), correction.attempt),
        );
        conversation.push(Message::user(text));
        Ok(())
    }

    /// Invoke `step` with arguments taken from the context and inject the
    /// exchange as a synthetic tool-call turn.
    fn force_call(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        seq: u32,
        ctx: &mut ExecutionContext,
        conversation: &mut Conversation,
    ) -> Result<(), RunError> {
        let tool = step.tool.as_str();
        let descriptor = self
            .registry
            .descriptor(tool)
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;
        let args = workflow
            .resolve_args(step, descriptor, ctx)
            .map_err(|err| ToolError::InvalidArguments {
                tool: tool.to_string(),
                errors: vec![err],
            })?;
        warn!(
            tool,
            corrections = ctx.corrections(tool),
            "forcing tool call after repeated corrections"
        );

        let call = ToolCall::new(format!("forced-{seq}"), tool, args);
        conversation.push(Message::assistant_tool_call("", call.clone()));
        let outcome = self.registry.call(tool, &call.arguments, ctx);
        conversation.push(Message::tool_result(&call, outcome.to_json().to_string()));
        ctx.reset_correction(tool);
        ctx.push_trace(TraceKind::ForcedCall, tool);
        outcome.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::Role;
    use crate::core::types::Phase;
    use crate::error::HandlerErrorKind;
    use crate::test_support::{
        ScriptedModel, TradeFixture, analysis_ready_context, fixture_registry, reply_call,
        reply_calls, reply_text,
    };
    use crate::workflows::{
        EXPIRY_LIST, INSTRUMENT_RESOLVE, OPTION_CHAIN, ORDER_PLACE, PLAN_BUILD, TREND_ANALYZE,
        default_workflows,
    };
    use serde_json::json;

    const SUMMARY: &str = "Analysis complete: bullish trend, plan built at entry 95.25.";

    fn run_analysis(
        model: &ScriptedModel,
        registry: &ToolRegistry,
        ctx: &mut ExecutionContext,
        config: LoopConfig,
    ) -> (Result<LoopOutcome, RunError>, Conversation) {
        let workflows = default_workflows();
        let request = LoopRequest {
            task: "Find an intraday NIFTY options trade",
            workflow: &workflows[&Phase::Analysis],
            mode: Some("intraday"),
        };
        let mut conversation = Conversation::new();
        let mut budget = CallBudget::new(40);
        let result = AgentLoop::new(registry, model, config).run(
            &request,
            ctx,
            &mut conversation,
            &mut budget,
            |_| None,
        );
        (result, conversation)
    }

    fn analysis_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(analysis_ready_context());
        ctx.set_phase(Phase::Analysis);
        ctx
    }

    fn compliant_calls() -> Vec<crate::io::model::ModelReply> {
        vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_call(TREND_ANALYZE, json!({})),
            reply_call(EXPIRY_LIST, json!({})),
            reply_call(OPTION_CHAIN, json!({})),
            reply_call(PLAN_BUILD, json!({})),
        ]
    }

    #[test]
    fn compliant_model_converges_on_final_answer() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = compliant_calls();
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();

        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let outcome = result.expect("converged");

        assert_eq!(outcome.final_output, SUMMARY);
        assert_eq!(outcome.iterations, 6);
        assert_eq!(outcome.forced_calls, 0);
        assert!(ctx.contains("plan.entry"));
        assert_eq!(conversation.count_role(Role::Tool), 5);
    }

    #[test]
    fn requests_offer_only_workflow_tools() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = compliant_calls();
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        run_analysis(&model, &registry, &mut ctx, LoopConfig::default())
            .0
            .expect("converged");

        let requests = model.requests();
        let offered: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered.len(), 5);
        assert!(!offered.contains(&"execution.order.place"));
        assert!(requests[0].system.contains("Next required tool: `market.instrument.resolve`"));
        assert!(requests[2].system.contains("Next required tool: `market.option.expiry_list`"));
    }

    #[test]
    fn stated_intent_is_forced_after_threshold_corrections() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_call(TREND_ANALYZE, json!({})),
        ];
        for _ in 0..3 {
            script.push(reply_text("I will now call the expiry list tool."));
        }
        script.push(reply_call(OPTION_CHAIN, json!({})));
        script.push(reply_call(PLAN_BUILD, json!({})));
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();

        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let outcome = result.expect("converged");

        assert_eq!(outcome.forced_calls, 1);
        assert!(ctx.has_called(EXPIRY_LIST));
        assert_eq!(ctx.corrections(EXPIRY_LIST), 0);
        let reminders = conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::User && m.content.contains("Call `market.option.expiry_list` now"))
            .count();
        assert_eq!(reminders, 3);
        let forced = conversation
            .messages()
            .iter()
            .find(|m| m.tool_calls.first().is_some_and(|c| c.id == "forced-1"))
            .expect("synthetic call");
        assert_eq!(forced.tool_calls[0].name, EXPIRY_LIST);
        assert!(
            ctx.trace()
                .iter()
                .any(|e| e.kind == TraceKind::ForcedCall && e.detail == EXPIRY_LIST)
        );
    }

    #[test]
    fn corrections_name_concrete_values() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::new(vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_text("```python\nmarket.trend.analyze(symbol='NIFTY')\n```"),
            reply_call(TREND_ANALYZE, json!({})),
            reply_call(EXPIRY_LIST, json!({})),
            reply_call(OPTION_CHAIN, json!({})),
            reply_call(PLAN_BUILD, json!({})),
            reply_text(SUMMARY),
        ]);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        result.expect("converged");

        let correction = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User && m.content.contains("contained code"))
            .expect("code correction");
        assert!(correction.content.contains("Call `market.trend.analyze` now"));
        assert!(correction.content.contains("- symbol = \"NIFTY\""));
        assert!(correction.content.contains("Reminder 1 of 3"));
    }

    #[test]
    fn only_first_of_several_calls_executes() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::new(vec![
            reply_calls(vec![
                (INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
                (TREND_ANALYZE, json!({})),
                (EXPIRY_LIST, json!({})),
            ]),
            reply_call(TREND_ANALYZE, json!({})),
            reply_call(EXPIRY_LIST, json!({})),
            reply_call(OPTION_CHAIN, json!({})),
            reply_call(PLAN_BUILD, json!({})),
            reply_text(SUMMARY),
        ]);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        result.expect("converged");

        assert_eq!(ctx.call_count(INSTRUMENT_RESOLVE), 1);
        assert_eq!(ctx.called_tools()[1], TREND_ANALYZE);
        assert!(
            conversation
                .messages()
                .iter()
                .any(|m| m.content.contains("You proposed 3 tool calls in one turn"))
        );
        assert!(ctx.trace().iter().any(|e| e.kind == TraceKind::CallsDiscarded));
    }

    #[test]
    fn failed_first_call_still_asks_for_one_call_per_turn() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = vec![reply_calls(vec![
            (OPTION_CHAIN, json!({})),
            (INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
        ])];
        script.extend(compliant_calls());
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let outcome = result.expect("converged");

        assert_eq!(outcome.iterations, 7);
        assert_eq!(ctx.call_count(INSTRUMENT_RESOLVE), 1);
        assert_eq!(ctx.called_tools()[0], INSTRUMENT_RESOLVE);
        let correction = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User && m.content.contains("The last tool call failed"))
            .expect("tool error correction");
        assert!(correction.content.contains("You proposed 2 tool calls in one turn"));
        assert!(correction.content.contains("`market.option.chain`, was considered"));
        assert!(ctx.trace().iter().any(|e| e.kind == TraceKind::CallsDiscarded));
    }

    #[test]
    fn refused_first_call_still_asks_for_one_call_per_turn() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = vec![reply_calls(vec![
            (ORDER_PLACE, json!({"quantity": 75})),
            (INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
        ])];
        script.extend(compliant_calls());
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        result.expect("converged");

        assert!(!ctx.has_called(ORDER_PLACE));
        let correction = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User && m.content.contains("is not available in the analysis phase"))
            .expect("not offered correction");
        assert!(correction.content.contains("You proposed 2 tool calls in one turn"));
        assert!(correction.content.contains("Call `market.instrument.resolve` now"));
    }

    #[test]
    fn failed_forced_call_ends_the_phase() {
        let registry = fixture_registry(&TradeFixture {
            chain_upstream_error: true,
            ..TradeFixture::default()
        });
        let mut script = vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_call(TREND_ANALYZE, json!({})),
            reply_call(EXPIRY_LIST, json!({})),
        ];
        for _ in 0..3 {
            script.push(reply_text("I will now call the option chain tool."));
        }
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());

        match result {
            Err(RunError::Tool(ToolError::Handler { tool, error })) => {
                assert_eq!(tool, OPTION_CHAIN);
                assert_eq!(error.kind, HandlerErrorKind::Upstream);
            }
            other => panic!("expected forced chain failure, got {other:?}"),
        }
        assert_eq!(model.remaining(), 0);
        assert!(!ctx.has_called(OPTION_CHAIN));
        assert!(!ctx.contains("option_chain"));
        assert!(
            ctx.trace()
                .iter()
                .any(|e| e.kind == TraceKind::ForcedCall && e.detail == OPTION_CHAIN)
        );

        let messages = conversation.messages();
        let (last, rest) = messages.split_last().expect("messages");
        assert_eq!(last.role, Role::Tool);
        assert!(last.content.contains("\"status\":\"error\""));
        assert!(last.content.contains("502"));
        let forced = rest.last().expect("forced call turn");
        assert_eq!(forced.tool_calls[0].id, "forced-1");
        assert_eq!(forced.tool_calls[0].name, OPTION_CHAIN);
    }

    #[test]
    fn derived_inputs_ignore_model_values() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::new(vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_call(TREND_ANALYZE, json!({"symbol": "BANKNIFTY"})),
            reply_call(EXPIRY_LIST, json!({})),
            reply_call(OPTION_CHAIN, json!({"expiry": "2030-01-01"})),
            reply_call(PLAN_BUILD, json!({})),
            reply_text(SUMMARY),
        ]);
        let mut ctx = analysis_context();
        run_analysis(&model, &registry, &mut ctx, LoopConfig::default())
            .0
            .expect("converged");

        assert_eq!(ctx.get("trend_analysis.symbol"), Some(&json!("NIFTY")));
        assert_eq!(ctx.get("option_chain.expiry"), Some(&json!("2024-06-27")));
    }

    #[test]
    fn precondition_failure_becomes_a_correction() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = vec![reply_call(OPTION_CHAIN, json!({}))];
        script.extend(compliant_calls());
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        result.expect("converged");

        let correction = conversation
            .messages()
            .iter()
            .find(|m| m.role == Role::User && m.content.contains("The last tool call failed"))
            .expect("tool error correction");
        assert!(correction.content.contains("precondition failed"));
        assert!(correction.content.contains("Call `market.instrument.resolve` now"));
    }

    #[test]
    fn tools_outside_the_workflow_are_refused() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = vec![reply_call("execution.order.place", json!({}))];
        script.extend(compliant_calls());
        script.push(reply_text(SUMMARY));
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        result.expect("converged");

        assert!(!ctx.has_called("execution.order.place"));
        assert!(
            conversation
                .messages()
                .iter()
                .any(|m| m.content.contains("`execution.order.place` is not available in the analysis phase"))
        );
    }

    #[test]
    fn avoid_trend_completes_workflow_early() {
        let registry = fixture_registry(&TradeFixture {
            trend: "avoid".to_string(),
            ..TradeFixture::default()
        });
        let model = ScriptedModel::new(vec![
            reply_call(INSTRUMENT_RESOLVE, json!({"symbol": "NIFTY"})),
            reply_call(TREND_ANALYZE, json!({})),
            reply_call(OPTION_CHAIN, json!({})),
            reply_text("No trade: the trend is avoid."),
        ]);
        let mut ctx = analysis_context();
        let (result, _) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let outcome = result.expect("converged");

        assert_eq!(outcome.final_output, "No trade: the trend is avoid.");
        assert!(!ctx.has_called(OPTION_CHAIN));
        assert!(!ctx.contains("plan"));
    }

    #[test]
    fn upstream_failure_ends_the_loop() {
        let registry = fixture_registry(&TradeFixture {
            chain_upstream_error: true,
            ..TradeFixture::default()
        });
        let model = ScriptedModel::new(compliant_calls());
        let mut ctx = analysis_context();
        let (result, _) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let err = result.expect_err("fatal");
        assert!(matches!(err, RunError::Tool(ToolError::Handler { .. })));
        assert!(!ctx.contains("option_chain"));
    }

    #[test]
    fn chatter_without_progress_hits_max_steps() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::repeating(reply_text("Markets look interesting today."));
        let mut ctx = analysis_context();
        let config = LoopConfig {
            max_steps: 3,
            correction_threshold: 5,
        };
        let (result, _) = run_analysis(&model, &registry, &mut ctx, config);
        match result.expect_err("no convergence") {
            RunError::NonConvergence { steps, pending, .. } => {
                assert_eq!(steps, 3);
                assert_eq!(pending, INSTRUMENT_RESOLVE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exhausted_budget_stops_before_calling_the_model() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::repeating(reply_text("thinking"));
        let workflows = default_workflows();
        let request = LoopRequest {
            task: "t",
            workflow: &workflows[&Phase::Analysis],
            mode: None,
        };
        let mut ctx = analysis_context();
        let mut budget = CallBudget::new(2);
        let err = AgentLoop::new(&registry, &model, LoopConfig::default())
            .run(&request, &mut ctx, &mut Conversation::new(), &mut budget, |_| None)
            .expect_err("budget");
        assert!(matches!(err, RunError::LlmBudgetExhausted { limit: 2, .. }));
        assert_eq!(model.requests().len(), 2);
    }

    #[test]
    fn kill_check_runs_after_tool_execution() {
        let registry = fixture_registry(&TradeFixture::default());
        let model = ScriptedModel::new(compliant_calls());
        let workflows = default_workflows();
        let request = LoopRequest {
            task: "t",
            workflow: &workflows[&Phase::Analysis],
            mode: None,
        };
        let mut ctx = analysis_context();
        let err = AgentLoop::new(&registry, &model, LoopConfig::default())
            .run(
                &request,
                &mut ctx,
                &mut Conversation::new(),
                &mut CallBudget::new(40),
                |ctx| ctx.has_called(TREND_ANALYZE).then(|| "feed lost".to_string()),
            )
            .expect_err("halt");
        assert!(matches!(err, RunError::KillSwitchTriggered { ref reason, .. } if reason == "feed lost"));
        assert!(!ctx.has_called(EXPIRY_LIST));
    }

    #[test]
    fn repeated_non_final_replies_close_a_complete_phase() {
        let registry = fixture_registry(&TradeFixture::default());
        let mut script = compliant_calls();
        for _ in 0..3 {
            script.push(reply_text("Let me check the chain once more."));
        }
        let model = ScriptedModel::new(script);
        let mut ctx = analysis_context();
        let (result, conversation) = run_analysis(&model, &registry, &mut ctx, LoopConfig::default());
        let outcome = result.expect("closed");
        assert_eq!(outcome.final_output, "analysis workflow complete");
        assert!(
            conversation
                .messages()
                .iter()
                .any(|m| m.content.contains("Reply with a short plain-text summary"))
        );
    }
}
