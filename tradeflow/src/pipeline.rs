//! Phase-gated trade run.
//!
//! [`Pipeline::run`] walks the phase machine from precheck to position
//! tracking. Each phase runs its agent loop (if it has a workflow) and its
//! checklist, either before or after the work; the kill switch is consulted
//! when a phase starts, after every tool call, and once more before a run is
//! reported complete.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::core::budget::CallBudget;
use crate::core::context::{ExecutionContext, TraceEvent, TraceKind};
use crate::core::conversation::Conversation;
use crate::core::phase::{PhaseMachine, Transition};
use crate::core::types::{FinalStatus, GuardAction, GuardFailure, GuardResult, Phase, RunStatus};
use crate::core::workflow::Workflow;
use crate::error::RunError;
use crate::exit_codes;
use crate::guard::{ChecklistGuard, GuardTiming};
use crate::io::alerts::{Alert, AlertSink};
use crate::io::config::TradeflowConfig;
use crate::io::model::ChatModel;
use crate::io::prompt::PromptBuilder;
use crate::looping::{AgentLoop, LoopConfig, LoopRequest};
use crate::tools::ToolRegistry;
use crate::workflows::default_workflows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub status: PhaseStatus,
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PhaseReport {
    fn new(status: PhaseStatus, iterations: u32, reason: Option<String>) -> Self {
        Self {
            status,
            iterations,
            reason,
        }
    }
}

/// Everything a caller needs to know about one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub final_status: FinalStatus,
    pub run_status: RunStatus,
    pub final_output: String,
    /// Human-readable reason for the final status.
    pub reason: String,
    /// Kind of the run error that ended the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub phases: BTreeMap<Phase, PhaseReport>,
    /// Guard rules that ended the run, verbatim.
    pub failures: Vec<GuardFailure>,
    pub halted: bool,
    pub alerts: Vec<Alert>,
    pub llm_calls: u32,
    pub max_llm_calls: u32,
    pub llm_calls_remaining: u32,
    pub forced_calls: u32,
    pub dry_run: bool,
    pub trace: Vec<TraceEvent>,
}

impl RunReport {
    /// A report for a run that has not started any phase yet.
    pub fn new(run_id: impl Into<String>, max_llm_calls: u32, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            final_status: FinalStatus::PrecheckFailed,
            run_status: RunStatus::Running,
            final_output: String::new(),
            reason: String::new(),
            error: None,
            mode: None,
            phases: Phase::ALL
                .into_iter()
                .map(|phase| (phase, PhaseReport::new(PhaseStatus::NotStarted, 0, None)))
                .collect(),
            failures: Vec::new(),
            halted: false,
            alerts: Vec::new(),
            llm_calls: 0,
            max_llm_calls,
            llm_calls_remaining: max_llm_calls,
            forced_calls: 0,
            dry_run,
            trace: Vec::new(),
        }
    }

    /// CLI exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.halted {
            return exit_codes::HALTED;
        }
        match self.final_status {
            FinalStatus::Completed => exit_codes::OK,
            FinalStatus::NoTrade => exit_codes::NO_TRADE,
            FinalStatus::SystemHalted => exit_codes::HALTED,
            FinalStatus::PrecheckFailed
            | FinalStatus::AnalysisFailed
            | FinalStatus::ValidationFailed
            | FinalStatus::ExecutionFailed => {
                if self.error.as_deref() == Some("guard_rejected") {
                    exit_codes::REJECTED
                } else {
                    exit_codes::INVALID
                }
            }
        }
    }
}

/// Run artifacts handed back to the caller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub conversation: Conversation,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub loop_config: LoopConfig,
    pub max_llm_calls: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            loop_config: LoopConfig::default(),
            max_llm_calls: 40,
        }
    }
}

impl From<&TradeflowConfig> for RunSettings {
    fn from(config: &TradeflowConfig) -> Self {
        Self {
            loop_config: LoopConfig::from(config),
            max_llm_calls: config.max_llm_calls,
        }
    }
}

/// Mutable state of one run.
struct RunState {
    ctx: ExecutionContext,
    conversation: Conversation,
    machine: PhaseMachine,
    budget: CallBudget,
    report: RunReport,
}

pub struct Pipeline<'a, M: ChatModel, A: AlertSink> {
    registry: &'a ToolRegistry,
    model: &'a M,
    guard: &'a ChecklistGuard,
    alerts: &'a A,
    workflows: BTreeMap<Phase, Workflow>,
    settings: RunSettings,
    prompts: PromptBuilder,
    run_id: String,
}

impl<'a, M: ChatModel, A: AlertSink> Pipeline<'a, M, A> {
    pub fn new(
        registry: &'a ToolRegistry,
        model: &'a M,
        guard: &'a ChecklistGuard,
        alerts: &'a A,
        settings: RunSettings,
    ) -> Self {
        Self {
            registry,
            model,
            guard,
            alerts,
            workflows: default_workflows(),
            settings,
            prompts: PromptBuilder::default(),
            run_id: "run".to_string(),
        }
    }

    /// Replace the workflows of the given phases.
    pub fn with_workflows(mut self, workflows: BTreeMap<Phase, Workflow>) -> Self {
        self.workflows.extend(workflows);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn workflows(&self) -> &BTreeMap<Phase, Workflow> {
        &self.workflows
    }

    /// Run one trade from `initial` context values to a terminal status.
    #[instrument(skip_all, fields(run_id = %self.run_id, dry_run = self.registry.is_dry_run()))]
    pub fn run(&self, task: &str, initial: Map<String, Value>) -> RunOutcome {
        let mut report = RunReport::new(
            self.run_id.clone(),
            self.settings.max_llm_calls,
            self.registry.is_dry_run(),
        );
        report.mode = self.guard.mode().map(str::to_string);
        let mut run = RunState {
            ctx: ExecutionContext::new(initial),
            conversation: Conversation::new(),
            machine: PhaseMachine::new(),
            budget: CallBudget::new(self.settings.max_llm_calls),
            report,
        };

        while !run.machine.status().is_terminal() {
            self.run_phase(task, &mut run);
        }

        let RunState {
            ctx,
            conversation,
            machine,
            budget,
            mut report,
        } = run;
        report.run_status = machine.status();
        report.llm_calls = budget.used();
        report.llm_calls_remaining = budget.remaining();
        report.forced_calls = count_trace(&ctx, None, TraceKind::ForcedCall);
        report.trace = ctx.trace().to_vec();
        info!(
            final_status = %report.final_status,
            llm_calls = report.llm_calls,
            budget_exhausted = budget.is_exhausted(),
            forced_calls = report.forced_calls,
            "run finished"
        );
        RunOutcome {
            report,
            conversation,
            context: ctx,
        }
    }

    fn run_phase(&self, task: &str, run: &mut RunState) {
        let phase = run.machine.current();
        run.ctx.set_phase(phase);
        run.ctx.push_trace(TraceKind::PhaseEntered, phase.as_str());
        info!(phase = %phase, "phase entered");

        let kill = self.kill_switch(&run.ctx);
        if !kill.passed {
            self.halt(run, phase, kill);
            return;
        }

        if phase == Phase::PositionTracking && self.registry.is_dry_run() {
            run.report.phases.insert(
                phase,
                PhaseReport::new(
                    PhaseStatus::Skipped,
                    0,
                    Some("dry run: no live order to track".to_string()),
                ),
            );
            let transition = run.machine.apply(&GuardResult::pass());
            self.settle(run, phase, transition, GuardResult::pass());
            return;
        }

        let timing = GuardTiming::for_phase(phase);
        let mut guard = GuardResult::pass();
        if timing == GuardTiming::BeforeWork {
            guard = self.evaluate(phase, &mut run.ctx);
            if !guard.passed {
                let transition = run.machine.apply(&guard);
                self.settle(run, phase, transition, guard);
                return;
            }
        }

        if let Some(workflow) = self.workflows.get(&phase) {
            match self.run_loop(task, workflow, run) {
                Ok(output) => run.report.final_output = output,
                Err(RunError::KillSwitchTriggered { .. }) => {
                    let kill = self.kill_switch(&run.ctx);
                    self.halt(run, phase, kill);
                    return;
                }
                Err(err) => {
                    self.fail(run, phase, err);
                    return;
                }
            }
        }

        if timing == GuardTiming::AfterWork {
            guard = self.evaluate(phase, &mut run.ctx);
        }
        let transition = run.machine.apply(&guard);
        self.settle(run, phase, transition, guard);
    }

    fn run_loop(&self, task: &str, workflow: &Workflow, run: &mut RunState) -> Result<String, RunError> {
        let agent = AgentLoop::new(self.registry, self.model, self.settings.loop_config)
            .with_prompts(self.prompts.clone());
        let request = LoopRequest {
            task,
            workflow,
            mode: self.guard.mode(),
        };
        let kill_check = |ctx: &ExecutionContext| {
            let verdict = self.guard.check_system_kill_conditions(&ctx.snapshot());
            (!verdict.passed).then(|| verdict.reason())
        };
        agent
            .run(
                &request,
                &mut run.ctx,
                &mut run.conversation,
                &mut run.budget,
                kill_check,
            )
            .map(|outcome| outcome.final_output)
    }

    fn evaluate(&self, phase: Phase, ctx: &mut ExecutionContext) -> GuardResult {
        let result = match phase {
            Phase::Precheck => self.guard.run_global_precheck(ctx.values()),
            _ => self.guard.run_phase_checks(phase, ctx.values()),
        };
        let detail = if result.passed && result.failures.is_empty() {
            "passed".to_string()
        } else if result.passed {
            format!("passed with advisories: {}", result.reason())
        } else {
            format!("{:?}: {}", result.action, result.reason())
        };
        ctx.push_trace(TraceKind::GuardEvaluated, detail);
        result
    }

    fn kill_switch(&self, ctx: &ExecutionContext) -> GuardResult {
        self.guard.check_system_kill_conditions(&ctx.snapshot())
    }

    /// Record the result of applying a guard verdict to the machine.
    fn settle(
        &self,
        run: &mut RunState,
        phase: Phase,
        transition: Result<Transition, String>,
        guard: GuardResult,
    ) {
        let iterations = phase_iterations(&run.ctx, phase);
        match transition {
            Ok(Transition::Advanced { to, .. }) => {
                self.mark_passed(run, phase, iterations);
                info!(from = %phase, to = %to, "phase advanced");
            }
            Ok(Transition::Completed { .. }) => {
                self.mark_passed(run, phase, iterations);
                let kill = self.kill_switch(&run.ctx);
                if !kill.passed {
                    self.halt(run, phase, kill);
                    return;
                }
                run.report.final_status = FinalStatus::Completed;
                run.report.reason = if run.report.dry_run {
                    "all phases passed (dry run)".to_string()
                } else {
                    "all phases passed".to_string()
                };
            }
            Ok(Transition::Terminated { .. }) => self.reject(run, phase, guard, iterations),
            Err(message) => {
                error!(phase = %phase, message = %message, "phase machine refused transition");
                run.machine.finish(RunStatus::Stopped);
                run.report.final_status = FinalStatus::failed_in(phase);
                run.report.reason = message.clone();
                run.report
                    .phases
                    .insert(phase, PhaseReport::new(PhaseStatus::Failed, iterations, Some(message)));
            }
        }
    }

    fn mark_passed(&self, run: &mut RunState, phase: Phase, iterations: u32) {
        if run.report.phases.get(&phase).map(|p| p.status) == Some(PhaseStatus::Skipped) {
            return;
        }
        let note = self.skip_note(phase, &run.ctx);
        run.report
            .phases
            .insert(phase, PhaseReport::new(PhaseStatus::Passed, iterations, note));
    }

    /// Why part of the phase workflow did not run, if a skip rule cut it short.
    fn skip_note(&self, phase: Phase, ctx: &ExecutionContext) -> Option<String> {
        let rule = self.workflows.get(&phase)?.short_circuited(ctx)?;
        let reason = if rule.reason.is_empty() {
            format!("`{}` matched a skip rule", rule.when)
        } else {
            rule.reason.clone()
        };
        Some(format!("skipped {}: {reason}", rule.skip.join(", ")))
    }

    /// A failed checklist ends the run in the status its action names.
    fn reject(&self, run: &mut RunState, phase: Phase, guard: GuardResult, iterations: u32) {
        let action = guard.action;
        run.report.failures = guard.failures.clone();
        run.report.final_status = match action {
            GuardAction::NoTrade => FinalStatus::NoTrade,
            _ => FinalStatus::failed_in(phase),
        };
        if matches!(action, GuardAction::StopSystem | GuardAction::StopAndAlert) {
            self.raise_alert(run, phase, &guard);
        }
        run.report.halted = action == GuardAction::StopSystem;
        let err = RunError::GuardRejected { phase, guard };
        warn!(phase = %phase, action = ?action, err = %err, "run ended by checklist");
        run.report.error = Some(err.kind().to_string());
        run.report.reason = err.to_string();
        let detail = match self.skip_note(phase, &run.ctx) {
            Some(note) => format!("{err}; {note}"),
            None => err.to_string(),
        };
        run.report
            .phases
            .insert(phase, PhaseReport::new(PhaseStatus::Failed, iterations, Some(detail)));
    }

    /// A kill-switch verdict halts the system and overrides any phase result.
    fn halt(&self, run: &mut RunState, phase: Phase, kill: GuardResult) {
        run.machine.halt();
        run.ctx.push_trace(TraceKind::KillSwitch, kill.reason());
        self.raise_alert(run, phase, &kill);
        let err = RunError::KillSwitchTriggered {
            phase,
            reason: kill.reason(),
        };
        error!(phase = %phase, err = %err, "system halted");
        let iterations = phase_iterations(&run.ctx, phase);
        run.report.final_status = FinalStatus::SystemHalted;
        run.report.halted = true;
        run.report.failures = kill.failures;
        run.report.error = Some(err.kind().to_string());
        run.report.reason = err.to_string();
        run.report.phases.insert(
            phase,
            PhaseReport::new(PhaseStatus::Failed, iterations, Some(err.to_string())),
        );
    }

    /// The phase's agent loop could not finish.
    fn fail(&self, run: &mut RunState, phase: Phase, err: RunError) {
        warn!(phase = %phase, err = %err, "phase failed");
        run.machine.finish(RunStatus::Stopped);
        let iterations = phase_iterations(&run.ctx, phase);
        run.report.final_status = FinalStatus::failed_in(phase);
        run.report.error = Some(err.kind().to_string());
        run.report.reason = format!("{:#}", anyhow::Error::new(err));
        run.report.phases.insert(
            phase,
            PhaseReport::new(PhaseStatus::Failed, iterations, Some(run.report.reason.clone())),
        );
    }

    fn raise_alert(&self, run: &mut RunState, phase: Phase, guard: &GuardResult) {
        let alert = Alert {
            phase,
            rules: guard.failures.iter().map(|f| f.rule_id.clone()).collect(),
            message: guard.reason(),
        };
        self.alerts.raise(&alert);
        run.report.alerts.push(alert);
    }
}

fn count_trace(ctx: &ExecutionContext, phase: Option<Phase>, kind: TraceKind) -> u32 {
    ctx.trace()
        .iter()
        .filter(|event| event.kind == kind && phase.is_none_or(|phase| event.phase == phase))
        .count() as u32
}

/// Model turns plus forced calls spent in `phase`.
fn phase_iterations(ctx: &ExecutionContext, phase: Phase) -> u32 {
    count_trace(ctx, Some(phase), TraceKind::ModelCall)
        + count_trace(ctx, Some(phase), TraceKind::ForcedCall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_report;

    #[test]
    fn new_report_lists_every_phase_as_not_started() {
        let report = RunReport::new("run-1", 40, false);
        assert_eq!(report.phases.len(), Phase::ALL.len());
        assert!(
            report
                .phases
                .values()
                .all(|p| p.status == PhaseStatus::NotStarted)
        );
    }

    #[test]
    fn exit_codes_follow_final_status() {
        let mut report = sample_report("run-1");
        report.final_status = FinalStatus::Completed;
        assert_eq!(report.exit_code(), exit_codes::OK);

        report.final_status = FinalStatus::NoTrade;
        assert_eq!(report.exit_code(), exit_codes::NO_TRADE);

        report.final_status = FinalStatus::ValidationFailed;
        report.error = Some("guard_rejected".to_string());
        assert_eq!(report.exit_code(), exit_codes::REJECTED);

        report.error = Some("non_convergence".to_string());
        assert_eq!(report.exit_code(), exit_codes::INVALID);

        report.final_status = FinalStatus::PrecheckFailed;
        report.halted = true;
        assert_eq!(report.exit_code(), exit_codes::HALTED);
    }

    #[test]
    fn report_serializes_phase_names_as_keys() {
        let report = sample_report("run-1");
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["phases"]["position_tracking"]["status"], "not_started");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["llm_calls_remaining"], 40);
    }
}
