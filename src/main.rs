use agent_pipeline::abort::AbortController;
use agent_pipeline::config::{PipelineConfig, load_pipeline_config};
use agent_pipeline::dag::{build_execution_plan, validate_dag};
use agent_pipeline::orchestrator::{PipelineRunner, RunOptions};
use agent_pipeline::runtime::RuntimeRegistry;
use agent_pipeline::state::{PipelineStatus, StageStatus, StateManager};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "agent-pipeline")]
#[command(version, about = "Run DAGs of LLM agent stages against a git repository")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (under .agent-pipeline/pipelines/) or a YAML path
        pipeline: String,
        /// Enable loop mode regardless of the pipeline's looping setting
        #[arg(long = "loop")]
        loop_enabled: bool,
        /// Cap on loop iterations
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Skip worktree setup and PR creation
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a pipeline definition and its dependency graph
    Validate { pipeline: String },
    /// Show the execution plan for a pipeline
    Plan { pipeline: String },
    /// List persisted runs
    Runs,
    /// List persisted loop sessions
    Loops,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir
            .canonicalize()
            .context("Failed to resolve project directory")?,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    match cli.command {
        Commands::Run {
            pipeline,
            loop_enabled,
            max_iterations,
            dry_run,
        } => {
            let path = resolve_pipeline_path(&project_dir, &pipeline)?;
            let config = load_pipeline_config(&path)?;
            let _guard = init_tracing(cli.verbose, Some((&project_dir, &config.name)));
            run_pipeline(project_dir, config, loop_enabled, max_iterations, dry_run).await
        }
        Commands::Validate { pipeline } => {
            let _guard = init_tracing(cli.verbose, None);
            validate_pipeline(&project_dir, &pipeline)
        }
        Commands::Plan { pipeline } => {
            let _guard = init_tracing(cli.verbose, None);
            show_plan(&project_dir, &pipeline)
        }
        Commands::Runs => {
            let _guard = init_tracing(cli.verbose, None);
            list_runs(&project_dir)
        }
        Commands::Loops => {
            let _guard = init_tracing(cli.verbose, None);
            list_loops(&project_dir)
        }
    }
}

async fn run_pipeline(
    project_dir: PathBuf,
    config: PipelineConfig,
    loop_enabled: bool,
    max_iterations: Option<u32>,
    dry_run: bool,
) -> Result<i32> {
    let registry = Arc::new(RuntimeRegistry::with_defaults());
    for name in registry.names() {
        if let Ok(runtime) = registry.resolve(Some(&name)) {
            for warning in runtime.validate().warnings {
                eprintln!("{} {warning}", style("warning:").yellow());
            }
        }
    }

    let abort = AbortController::new();
    let ctrl_c_abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", style("interrupt received, aborting run...").yellow());
            ctrl_c_abort.abort();
        }
    });

    let options = RunOptions {
        verbose: false,
        interactive: false,
        dry_run,
        loop_enabled,
        max_loop_iterations: max_iterations,
        abort: Some(abort),
    };
    let runner = PipelineRunner::new(project_dir, registry, options);
    let state = runner.run_pipeline(&config).await?;

    print_summary(&state);
    Ok(match state.status {
        PipelineStatus::Completed => 0,
        _ => 1,
    })
}

fn print_summary(state: &agent_pipeline::state::PipelineState) {
    let status = match state.status {
        PipelineStatus::Completed => style("completed").green(),
        PipelineStatus::Partial => style("partial").yellow(),
        PipelineStatus::Aborted => style("aborted").yellow(),
        _ => style(state.status.as_str()).red(),
    };
    println!(
        "\n{} {} ({}) — {} in {:.1}s",
        style("Pipeline").bold(),
        state.pipeline_config.name,
        state.run_id,
        status,
        state.artifacts.total_duration_ms as f64 / 1000.0,
    );

    for execution in &state.stages {
        let mark = match execution.status {
            StageStatus::Success => style("ok").green(),
            StageStatus::Failed => style("failed").red(),
            StageStatus::Skipped => style("skipped").dim(),
            other => style(other.as_str()).dim(),
        };
        let duration = execution
            .duration_ms
            .map(|ms| format!(" {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        let commit = execution
            .commit_sha
            .as_deref()
            .map(|sha| format!(" [{}]", &sha[..sha.len().min(8)]))
            .unwrap_or_default();
        println!("  {mark:>8}  {}{duration}{commit}", execution.stage_name);
        if let Some(ref error) = execution.error {
            let first_line = error.message.lines().next().unwrap_or("");
            println!("            {}", style(first_line).red());
            if let Some(ref suggestion) = error.suggestion {
                println!("            {}", style(suggestion).dim());
            }
        }
    }

    if let Some(ref pr) = state.artifacts.pull_request {
        println!("  {}: {}", style("pull request").bold(), pr.url);
    }
    if let Some(ref dir) = state.artifacts.handover_dir {
        println!("  {}: {}", style("handover").dim(), dir.display());
    }
}

fn validate_pipeline(project_dir: &std::path::Path, pipeline: &str) -> Result<i32> {
    let path = resolve_pipeline_path(project_dir, pipeline)?;
    let config = match load_pipeline_config(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("{} {e}", style("invalid:").red().bold());
            return Ok(1);
        }
    };

    let report = validate_dag(&config);
    for warning in &report.warnings {
        println!("{} {warning}", style("warning:").yellow());
    }
    if report.valid() {
        println!(
            "{} {} ({} stages)",
            style("valid:").green().bold(),
            config.name,
            config.stages.len()
        );
        Ok(0)
    } else {
        for error in &report.errors {
            println!("{} {error}", style("error:").red().bold());
        }
        Ok(1)
    }
}

fn show_plan(project_dir: &std::path::Path, pipeline: &str) -> Result<i32> {
    let path = resolve_pipeline_path(project_dir, pipeline)?;
    let config = load_pipeline_config(&path)?;
    let plan = build_execution_plan(&config)?;

    println!("{}", plan.describe());
    for group in &plan.groups {
        println!(
            "  level {}: {}",
            group.level,
            group.stage_names().join(", ")
        );
    }
    for warning in &plan.warnings {
        println!("{} {warning}", style("warning:").yellow());
    }
    println!(
        "max parallelism {}, {}",
        plan.max_parallelism(),
        if plan.is_sequential() {
            "sequential"
        } else {
            "parallel"
        }
    );
    Ok(0)
}

fn list_runs(project_dir: &std::path::Path) -> Result<i32> {
    let store = StateManager::new(project_dir);
    let runs = store.list_runs()?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(0);
    }
    for run_id in runs {
        match store.load_run(&run_id) {
            Ok(state) => println!(
                "{}  {:<10} {}",
                run_id,
                state.status.as_str(),
                state.pipeline_config.name
            ),
            Err(_) => println!("{run_id}  (unreadable)"),
        }
    }
    Ok(0)
}

fn list_loops(project_dir: &std::path::Path) -> Result<i32> {
    let store = StateManager::new(project_dir);
    let sessions = store.list_loop_sessions()?;
    if sessions.is_empty() {
        println!("No loop sessions found");
        return Ok(0);
    }
    for session_id in sessions {
        match store.load_loop_session(&session_id) {
            Ok(session) => println!(
                "{}  {:?}  {} iterations",
                session_id, session.status, session.total_iterations
            ),
            Err(_) => println!("{session_id}  (unreadable)"),
        }
    }
    Ok(0)
}

/// Resolve a pipeline argument: a literal path, or a name under
/// `.agent-pipeline/pipelines/`.
fn resolve_pipeline_path(project_dir: &std::path::Path, pipeline: &str) -> Result<PathBuf> {
    let literal = PathBuf::from(pipeline);
    if literal.exists() {
        return Ok(literal);
    }
    let pipelines_dir = project_dir.join(".agent-pipeline").join("pipelines");
    for candidate in [
        pipelines_dir.join(format!("{pipeline}.yml")),
        pipelines_dir.join(format!("{pipeline}.yaml")),
    ] {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!(
        "no pipeline '{pipeline}' found (looked for a file and under {})",
        pipelines_dir.display()
    );
}

/// Stderr logging always; an append-only per-pipeline file when running.
fn init_tracing(
    verbose: bool,
    log_target: Option<(&std::path::Path, &str)>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose || std::env::var("DEBUG").is_ok() {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_target {
        Some((project_dir, pipeline_name)) => {
            let log_dir = project_dir.join(".agent-pipeline").join("logs");
            std::fs::create_dir_all(&log_dir).ok();
            let appender =
                tracing_appender::rolling::never(log_dir, format!("{pipeline_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
