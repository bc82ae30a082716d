//! Phase-gated trading pipeline runner.
//!
//! `tradeflow run` drives a model through the trading workflows; the other
//! subcommands exercise single pieces (a tool, a checklist, the kill switch,
//! the configuration files) for diagnostics.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use tradeflow::core::context::ExecutionContext;
use tradeflow::core::types::{GuardAction, GuardResult, Phase};
use tradeflow::exit_codes;
use tradeflow::guard::ChecklistGuard;
use tradeflow::io::alerts::TracingAlertSink;
use tradeflow::io::checklist_config::load_checklist;
use tradeflow::io::config::{TradeflowConfig, load_config};
use tradeflow::io::model::CommandModel;
use tradeflow::io::run_log::{RunLogWriteRequest, generate_run_id, write_run_log};
use tradeflow::io::tool_manifest::{check_workflow_tools, load_tool_manifest, register_manifest_tools};
use tradeflow::logging;
use tradeflow::pipeline::{Pipeline, RunSettings};
use tradeflow::tools::ToolRegistry;
use tradeflow::workflows::default_workflows;

const DEFAULT_CONFIG: &str = "tradeflow.toml";

#[derive(Parser)]
#[command(
    name = "tradeflow",
    version,
    about = "Phase-gated tool orchestration for LLM-driven options trading"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline and print the run report.
    Run {
        /// Trading task handed to the model.
        #[arg(long)]
        task: String,
        /// JSON object with the initial run context.
        #[arg(long)]
        context: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Checklist TOML (built-in checklist when omitted).
        #[arg(long)]
        checklist: Option<PathBuf>,
        /// Tool manifest TOML binding tools to commands.
        #[arg(long)]
        tools: Option<PathBuf>,
        /// Checklist sub-mode, overriding the config.
        #[arg(long)]
        mode: Option<String>,
        /// Simulate write tools.
        #[arg(long)]
        dry_run: bool,
    },
    /// Call one tool through the registry, bypassing the agent loop.
    Call {
        tool: String,
        /// JSON object with the model-side arguments.
        #[arg(long, default_value = "{}")]
        args: String,
        /// JSON object with the context the call runs against.
        #[arg(long)]
        context: Option<PathBuf>,
        /// Phase the call is made in.
        #[arg(long, default_value = "analysis")]
        phase: Phase,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        tools: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Evaluate one phase checklist against a snapshot.
    Check {
        phase: Phase,
        /// JSON object with the values the rules see.
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        checklist: Option<PathBuf>,
    },
    /// Evaluate the system kill conditions.
    KillCheck {
        /// JSON object with the kill-switch fields.
        #[arg(long)]
        state: PathBuf,
    },
    /// Load and validate the config, checklist and tool manifest.
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        checklist: Option<PathBuf>,
        #[arg(long)]
        tools: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            context,
            config,
            checklist,
            tools,
            mode,
            dry_run,
        } => cmd_run(RunArgs {
            task,
            context,
            config,
            checklist,
            tools,
            mode,
            dry_run,
        }),
        Command::Call {
            tool,
            args,
            context,
            phase,
            config,
            tools,
            dry_run,
        } => cmd_call(&tool, &args, context.as_deref(), phase, &config, tools.as_deref(), dry_run),
        Command::Check {
            phase,
            snapshot,
            mode,
            checklist,
        } => cmd_check(phase, &snapshot, mode, checklist.as_deref()),
        Command::KillCheck { state } => cmd_kill_check(&state),
        Command::Validate {
            config,
            checklist,
            tools,
        } => cmd_validate(&config, checklist.as_deref(), tools.as_deref()),
    }
}

struct RunArgs {
    task: String,
    context: PathBuf,
    config: PathBuf,
    checklist: Option<PathBuf>,
    tools: Option<PathBuf>,
    mode: Option<String>,
    dry_run: bool,
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let cfg = load_config(&args.config)?;
    let checklist = load_checklist(args.checklist.as_deref())?;
    let initial = read_json_object(&args.context)?;

    let mut registry = ToolRegistry::new().with_dry_run(cfg.dry_run || args.dry_run);
    let mut workflows = default_workflows();
    if let Some(path) = &args.tools {
        let manifest = load_tool_manifest(path)?;
        register_manifest_tools(&mut registry, &manifest, &cfg.tools)?;
        workflows.extend(manifest.workflows);
    }
    check_workflow_tools(&registry, &workflows)?;

    let guard = ChecklistGuard::new(checklist, args.mode.or_else(|| cfg.mode.clone()));
    let model = CommandModel::from_config(&cfg.model);
    let alerts = TracingAlertSink;
    let run_id = match &cfg.run_log_dir {
        Some(dir) => generate_run_id(dir)?,
        None => "run".to_string(),
    };

    let pipeline = Pipeline::new(&registry, &model, &guard, &alerts, RunSettings::from(&cfg))
        .with_workflows(workflows)
        .with_run_id(run_id);
    let outcome = pipeline.run(&args.task, initial);

    if let Some(root) = &cfg.run_log_dir {
        let paths = write_run_log(&RunLogWriteRequest {
            root,
            report: &outcome.report,
            conversation: &outcome.conversation,
            context: &outcome.context,
        })?;
        info!(dir = %paths.dir.display(), "run log written");
    }
    print_json(&outcome.report)?;
    Ok(outcome.report.exit_code())
}

fn cmd_call(
    tool: &str,
    raw_args: &str,
    context: Option<&Path>,
    phase: Phase,
    config: &Path,
    tools: Option<&Path>,
    dry_run: bool,
) -> Result<i32> {
    let cfg = load_config(config)?;
    let mut registry = ToolRegistry::new().with_dry_run(cfg.dry_run || dry_run);
    if let Some(path) = tools {
        register_manifest_tools(&mut registry, &load_tool_manifest(path)?, &cfg.tools)?;
    }
    let args = parse_json_object(raw_args, "--args")?;
    let initial = match context {
        Some(path) => read_json_object(path)?,
        None => Map::new(),
    };

    let mut ctx = ExecutionContext::new(initial);
    ctx.set_phase(phase);
    let outcome = registry.call(tool, &args, &mut ctx);
    print_json(&outcome.to_json())?;
    Ok(if outcome.is_success() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_check(phase: Phase, snapshot: &Path, mode: Option<String>, checklist: Option<&Path>) -> Result<i32> {
    let guard = ChecklistGuard::new(load_checklist(checklist)?, mode);
    let values = read_json_object(snapshot)?;
    let result = match phase {
        Phase::Precheck => guard.run_global_precheck(&values),
        _ => guard.run_phase_checks(phase, &values),
    };
    print_json(&result)?;
    Ok(guard_exit_code(&result))
}

fn cmd_kill_check(state: &Path) -> Result<i32> {
    let guard = ChecklistGuard::new(Default::default(), None);
    let snapshot = Value::Object(read_json_object(state)?);
    let result = guard.check_system_kill_conditions(&snapshot);
    print_json(&result)?;
    Ok(guard_exit_code(&result))
}

fn cmd_validate(config: &Path, checklist: Option<&Path>, tools: Option<&Path>) -> Result<i32> {
    let cfg = load_config(config)?;
    let checklist = load_checklist(checklist)?;
    check_mode(&cfg, &checklist.modes().into_iter().collect::<Vec<_>>())?;

    let mut registry = ToolRegistry::new();
    let mut workflows = default_workflows();
    if let Some(path) = tools {
        let manifest = load_tool_manifest(path)?;
        register_manifest_tools(&mut registry, &manifest, &cfg.tools)?;
        workflows.extend(manifest.workflows);
        check_workflow_tools(&registry, &workflows)?;
    }
    println!(
        "ok: {} checklist phases, {} tools, {} workflows",
        checklist.phases.len(),
        registry.len(),
        workflows.len()
    );
    Ok(exit_codes::OK)
}

fn check_mode(cfg: &TradeflowConfig, modes: &[&str]) -> Result<()> {
    match cfg.mode.as_deref() {
        Some(mode) if !modes.contains(&mode) => Err(anyhow!(
            "mode '{mode}' is not defined by the checklist (known: {})",
            modes.join(", ")
        )),
        _ => Ok(()),
    }
}

fn guard_exit_code(result: &GuardResult) -> i32 {
    if result.passed {
        return exit_codes::OK;
    }
    match result.action {
        GuardAction::NoTrade => exit_codes::NO_TRADE,
        GuardAction::StopSystem => exit_codes::HALTED,
        GuardAction::Continue | GuardAction::Reject | GuardAction::StopAndAlert => {
            exit_codes::REJECTED
        }
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_json_object(&raw, &path.display().to_string())
}

fn parse_json_object(raw: &str, origin: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("parse {origin}"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("{origin} must be a JSON object")),
    }
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run() {
        let cli = Cli::parse_from([
            "tradeflow",
            "run",
            "--task",
            "NIFTY weekly",
            "--context",
            "ctx.json",
            "--dry-run",
        ]);
        match cli.command {
            Command::Run {
                task,
                config,
                dry_run,
                ..
            } => {
                assert_eq!(task, "NIFTY weekly");
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_check_phase_name() {
        let cli = Cli::parse_from([
            "tradeflow",
            "check",
            "validation",
            "--snapshot",
            "s.json",
        ]);
        assert!(matches!(
            cli.command,
            Command::Check {
                phase: Phase::Validation,
                ..
            }
        ));
    }

    #[test]
    fn guard_actions_map_to_exit_codes() {
        let failed = |action| GuardResult::fail(Vec::new(), action);
        assert_eq!(guard_exit_code(&GuardResult::pass()), exit_codes::OK);
        assert_eq!(guard_exit_code(&failed(GuardAction::NoTrade)), exit_codes::NO_TRADE);
        assert_eq!(guard_exit_code(&failed(GuardAction::Reject)), exit_codes::REJECTED);
        assert_eq!(guard_exit_code(&failed(GuardAction::StopSystem)), exit_codes::HALTED);
    }

    #[test]
    fn context_must_be_an_object() {
        assert!(parse_json_object("[1, 2]", "ctx.json").is_err());
        let map = parse_json_object(r#"{"symbol": "NIFTY"}"#, "ctx.json").expect("object");
        assert_eq!(map["symbol"], "NIFTY");
    }
}
