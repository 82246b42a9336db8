mod config;

use anyhow::Context as _;
use arbor_actions::{ActionExecutor, ActionRegistry, EchoAction};
use arbor_core::ArborError;
use arbor_events::{handler_fn, Delivery, EventBus};
use arbor_orchestrator::{
    InstrumentedModel, LanguageModel, LlmPlanner, Orchestrator, PlanSpec, Planner, RunMonitor,
    RunReport, ScriptedModel, StaticPlanner,
};
use clap::{Parser, Subcommand};
use config::ArborConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor", about = "Arbor: event-driven task graph orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "arbor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run and print its report
    Run {
        /// Plan file (TOML) to replay
        #[arg(long, required_unless_present = "goal", conflicts_with = "goal")]
        plan: Option<PathBuf>,
        /// Goal to plan with a scripted model
        #[arg(long, requires = "script")]
        goal: Option<String>,
        /// JSON array of canned model replies
        #[arg(long)]
        script: Option<PathBuf>,
        /// Print every event as a JSON line
        #[arg(long)]
        events: bool,
    },
    /// Validate a plan file
    Check {
        /// Plan file (TOML)
        plan: PathBuf,
    },
    /// List registered actions
    Actions {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

fn registry() -> anyhow::Result<Arc<ActionRegistry>> {
    let registry = ActionRegistry::builder()
        .register(Arc::new(EchoAction::new()))?
        .build();
    Ok(Arc::new(registry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ArborConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config file '{}'", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            plan,
            goal,
            script,
            events,
        } => {
            let report = run(config, plan, goal, script, events).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                let reason = report
                    .error
                    .map(|e| format!("{}: {}", e.error_type, e.message))
                    .unwrap_or_default();
                anyhow::bail!("run {} failed ({reason})", report.run_id);
            }
        }
        Commands::Check { plan } => {
            let spec = PlanSpec::load(&plan)
                .with_context(|| format!("Invalid plan '{}'", plan.display()))?;
            print_plan(&spec, "0", 0);
        }
        Commands::Actions { json } => {
            let registry = registry()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&registry.catalog())?);
            } else {
                println!("{}", registry.render_catalog());
                println!("Total: {} action(s)", registry.len());
            }
        }
    }

    Ok(())
}

async fn run(
    config: ArborConfig,
    plan: Option<PathBuf>,
    goal: Option<String>,
    script: Option<PathBuf>,
    events: bool,
) -> anyhow::Result<RunReport> {
    let bus = EventBus::new(config.bus.clone())?;
    let topic = config.orchestrator.topic.clone();
    if events {
        bus.subscribe_all(
            &topic,
            handler_fn(|d: Delivery| async move {
                println!("{}", d.event.to_json()?);
                Ok::<(), ArborError>(())
            }),
        )?;
    }

    let registry = registry()?;
    let monitor = RunMonitor::new();
    let (planner, goal, task_type): (Arc<dyn Planner>, String, String) = match (plan, goal) {
        (Some(path), _) => {
            let spec = PlanSpec::load(&path)
                .with_context(|| format!("Invalid plan '{}'", path.display()))?;
            let (goal, task_type) = (spec.goal.clone(), spec.task_type.clone());
            let planner: Arc<dyn Planner> = Arc::new(StaticPlanner::new(spec)?);
            (planner, goal, task_type)
        }
        (None, Some(goal)) => {
            let path = script.context("--goal needs --script")?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read script '{}'", path.display()))?;
            let replies: Vec<String> = serde_json::from_str(&text)
                .with_context(|| format!("Script '{}' is not a JSON array of strings", path.display()))?;
            info!(replies = replies.len(), "Using scripted model");
            let model: Arc<dyn LanguageModel> = Arc::new(
                InstrumentedModel::new(
                    Arc::new(ScriptedModel::new(replies)),
                    bus.clone(),
                    topic.clone(),
                    config.orchestrator.source_service.clone(),
                    config.llm.clone(),
                )
                .with_monitor(monitor.clone()),
            );
            let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(
                model,
                registry.clone(),
                config.orchestrator.max_depth,
            )?);
            (planner, goal, "GENERAL".to_string())
        }
        (None, None) => anyhow::bail!("either --plan or --goal is required"),
    };

    let orchestrator = Orchestrator::with_monitor(
        bus.clone(),
        ActionExecutor::new(registry),
        planner,
        config.orchestrator,
        monitor,
    )?;
    let report = orchestrator.run(goal, task_type).await?;
    orchestrator.shutdown().await;
    bus.close().await?;
    Ok(report)
}

fn print_plan(spec: &PlanSpec, nid: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let what = match &spec.action {
        Some(call) => format!("-> {}", call.name),
        None => format!("({} subtasks)", spec.subtasks.len()),
    };
    let after = if spec.depends_on.is_empty() {
        String::new()
    } else {
        format!(" after [{}]", spec.depends_on.join(", "))
    };
    println!("{indent}{nid} {} [{}] {what}{after}", spec.goal, spec.task_type);
    for (i, child) in spec.subtasks.iter().enumerate() {
        print_plan(child, &format!("{nid}.{}", i + 1), depth + 1);
    }
}
