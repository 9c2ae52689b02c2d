/// Pipeline orchestrator binary
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline_core::{PipelineDefinition, Registry};
use pipeline_orchestrator::{Orchestrator, OrchestratorConfig, WatchState};
use pipeline_units::{register_builtin, HttpPluginUnit};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeline-orchestrator")]
#[command(version, about = "Run cancellable chains of plugin work units")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// HTTP plugin route definitions (YAML) to register as units
    #[arg(long = "plugin", global = true)]
    plugins: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline definition to completion
    Run {
        /// Pipeline definition (YAML)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Initial argument as JSON
        #[arg(short, long, default_value = "null")]
        input: String,

        /// Timeout in seconds, overriding the pipeline and config values
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Worker slots
        #[arg(short, long)]
        workers: Option<usize>,

        /// Orchestrator configuration (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List registered units
    Units,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry(plugins: &[PathBuf]) -> Result<Registry> {
    let mut registry = Registry::new();
    register_builtin(&mut registry);
    for path in plugins {
        let unit = HttpPluginUnit::from_yaml(path)
            .with_context(|| format!("Failed to load plugin {}", path.display()))?;
        registry.register(Arc::new(unit));
    }
    Ok(registry)
}

fn exit_code(state: WatchState) -> i32 {
    match state {
        WatchState::Completed => 0,
        WatchState::Failed => 1,
        WatchState::TimedOut => 2,
        WatchState::Cancelled => 3,
        WatchState::Submitted | WatchState::Running => 4,
    }
}

async fn run(
    registry: Registry,
    pipeline: PathBuf,
    input: String,
    timeout: Option<u64>,
    workers: Option<usize>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let mut config = match config {
        Some(path) => OrchestratorConfig::from_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let definition = PipelineDefinition::from_file(&pipeline)
        .with_context(|| format!("Failed to load pipeline {}", pipeline.display()))?;
    let arg: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;

    let orchestrator = Orchestrator::in_process(registry, config)?;
    let chain = orchestrator.build_chain(&definition)?;
    let timeout = timeout.map(Duration::from_secs).or_else(|| definition.timeout());

    info!(
        "Running pipeline '{}' with {} stages",
        definition.name,
        chain.len()
    );

    let run = orchestrator.submit_pipeline(chain, arg, timeout).await?;
    let run_id = run.id();
    let wait = run.wait();
    tokio::pin!(wait);

    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling run {}", run_id);
            orchestrator.cancel(run_id).await?;
            wait.await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    let state = report.state();
    if state == WatchState::Completed {
        info!("Run {} completed in {:?}", run_id, report.elapsed);
    } else {
        error!("Run {} ended {}", run_id, state);
    }
    Ok(exit_code(state))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = build_registry(&cli.plugins)?;

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            timeout,
            workers,
            config,
        } => {
            let code = run(registry, pipeline, input, timeout, workers, config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Units => {
            for name in registry.unit_names() {
                if let Some(unit) = registry.get(&name) {
                    let config = unit.config();
                    let inputs: Vec<String> = config
                        .inputs
                        .iter()
                        .map(|f| {
                            let marker = if f.optional { "?" } else { "" };
                            format!("{}{}: {}", f.name, marker, f.kind)
                        })
                        .collect();
                    println!(
                        "{:<24} ({}) -> {}  {}",
                        name,
                        inputs.join(", "),
                        config.output,
                        config.description
                    );
                }
            }
        }
    }

    Ok(())
}
