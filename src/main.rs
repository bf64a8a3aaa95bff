//! askflow - answer business questions with a graph of cooperating tasks.
//!
//! Usage:
//!   askflow ask <QUESTION>   Run the pipeline for one question and print the answer
//!   askflow plan             Print the pipeline's execution layers
//!   askflow validate         Check a configuration file and the pipeline graph

use askflow::pipeline::{self, Services, Turn};
use askflow::{
    AppConfig, Event, EventBus, EventHandler, ExecutionReport, FallbackReason, RetryPolicy,
    RunStatus, SkipReason, YamlLoader, plan_layers,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Used when no `--schema` file is given.
const DEFAULT_SCHEMA: &str = "\
Opportunity(Id, Name, Amount, StageName, CloseDate, IsClosed, IsWon, OwnerId, AccountId)
Account(Id, Name, Industry, AnnualRevenue)
User(Id, Name, Email)";

/// askflow - answer business questions over CRM and analytics data
#[derive(Parser)]
#[command(name = "askflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask {
        /// The question to answer
        #[arg(value_name = "QUESTION")]
        question: String,

        /// Path to a YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// File describing the CRM schema
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// JSON file with earlier turns: [{"role": "user", "content": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,

        /// Use simulated backends only
        #[arg(long)]
        simulate: bool,

        /// Print the execution path and recorded errors after the answer
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the pipeline's execution layers
    Plan,

    /// Validate a configuration file and the pipeline graph
    Validate {
        /// Path to a YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Logs lifecycle events as they happen.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted {
                run_id,
                graph_id,
                task_count,
                layer_count,
                ..
            } => {
                info!(
                    "Run {} of '{}' started: {} task(s) in {} layer(s)",
                    run_id, graph_id, task_count, layer_count
                );
            }
            Event::TaskStarted { task_id, .. } => {
                info!("  Task '{}' started", task_id);
            }
            Event::TaskRetrying {
                task_id,
                attempt,
                max_attempts,
                ..
            } => {
                warn!(
                    "  Task '{}' attempt {}/{} failed, retrying",
                    task_id, attempt, max_attempts
                );
            }
            Event::FallbackInvoked {
                task_id, reason, ..
            } => match reason {
                FallbackReason::PrimaryFailed(error) => {
                    warn!("  Task '{}' falling back: {}", task_id, error);
                }
                FallbackReason::PrimaryUnavailable(reason) => {
                    info!("  Task '{}' using fallback ({})", task_id, reason);
                }
            },
            Event::TaskCompleted {
                task_id,
                duration,
                degraded,
                ..
            } => {
                let mode = if *degraded { " (degraded)" } else { "" };
                info!("  Task '{}' completed in {:?}{}", task_id, duration, mode);
            }
            Event::TaskFailed { task_id, error, .. } => {
                warn!("  Task '{}' failed: {}", task_id, error);
            }
            Event::TaskSkipped {
                task_id, reason, ..
            } => match reason {
                SkipReason::UpstreamFailed(upstream) => {
                    warn!("  Task '{}' skipped: '{}' failed", task_id, upstream);
                }
                SkipReason::FailFast => warn!("  Task '{}' skipped: run stopped", task_id),
                SkipReason::Aborted => warn!("  Task '{}' skipped: run aborted", task_id),
            },
            Event::RunTimedOut { deadline, .. } => {
                error!("Run exceeded its {:?} deadline", deadline);
            }
            Event::RunCompleted {
                run_id,
                status,
                duration,
                ..
            } => {
                if *status == RunStatus::Succeeded {
                    info!("Run {} succeeded in {:?}", run_id, duration);
                } else {
                    warn!("Run {} finished {} after {:?}", run_id, status, duration);
                }
            }
            Event::LayerStarted { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask {
            question,
            config,
            schema,
            history,
            simulate,
            verbose,
        } => {
            let status = ask(
                &question,
                config.as_deref(),
                schema.as_deref(),
                history.as_deref(),
                simulate,
                verbose,
            )
            .await?;
            if status == RunStatus::Aborted {
                std::process::exit(1);
            }
        }
        Commands::Plan => {
            print_plan().await?;
        }
        Commands::Validate { config } => {
            validate(config.as_deref()).await?;
        }
    }

    Ok(())
}

/// Run the pipeline for one question.
async fn ask(
    question: &str,
    config_path: Option<&Path>,
    schema_path: Option<&Path>,
    history_path: Option<&Path>,
    simulate: bool,
    verbose: bool,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let mut config = YamlLoader::load_or_default(config_path)?;
    config.pipeline.simulate |= simulate;

    let schema = match schema_path {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_SCHEMA.to_string(),
    };
    let history: Vec<Turn> = match history_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    if config.pipeline.simulate {
        info!("Using simulated backends");
    } else {
        let models = &config.completion.models;
        info!(
            "Using models {} / {} / {} / {} at {}",
            models.ultra_fast,
            models.fast,
            models.balanced,
            models.accurate,
            config.completion.base_url
        );
    }

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let services = Services::from_config(&config)?;
    let orchestrator = pipeline::build_orchestrator(&config, &services, Some(event_bus)).await?;

    let ctx = pipeline::initial_context(question, &history, &schema)?;
    let report = orchestrator.run(ctx).await;

    println!("{}", pipeline::render_answer(&report));
    if verbose {
        print_report(&report);
    }

    Ok(report.status)
}

fn print_report(report: &ExecutionReport) {
    println!();
    println!("Run {} ({}) in {:?}", report.run_id, report.status, report.duration);
    println!("Execution path:");
    for entry in report.execution_path() {
        let mode = if entry.degraded { " (degraded)" } else { "" };
        println!("  - {}{}", entry.task_id, mode);
    }
    if !report.errors().is_empty() {
        println!("Errors:");
        for entry in report.errors() {
            match &entry.task_id {
                Some(task_id) => println!("  - {}: {}", task_id, entry.message),
                None => println!("  - {}", entry.message),
            }
        }
    }
}

/// Print each layer of the pipeline with its dependencies.
async fn print_plan() -> Result<(), Box<dyn std::error::Error>> {
    let graph = pipeline::graph()?;
    let plan = plan_layers(&graph);
    let registry = pipeline::registry(&Services::simulated(), &RetryPolicy::default()).await?;

    println!(
        "Graph '{}': {} task(s) in {} layer(s)",
        pipeline::GRAPH_ID,
        graph.len(),
        plan.len()
    );
    println!();

    for (index, layer) in plan.layers().iter().enumerate() {
        println!("Layer {}:", index);
        for task_id in layer {
            let line = registry
                .get(task_id)
                .map(|registration| registration.outline())
                .unwrap_or_else(|| task_id.to_string());
            let deps = graph.dependencies(task_id);
            if deps.is_empty() {
                println!("  - {}", line);
            } else {
                let dep_names: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                println!("  - {} (depends on: {})", line, dep_names.join(", "));
            }
        }
    }

    Ok(())
}

/// Load the configuration and assemble the pipeline against simulated
/// backends, reporting the first problem found.
async fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config: AppConfig = match YamlLoader::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration invalid: {}", e);
            return Err(e.into());
        }
    };

    match pipeline::build_orchestrator(&config, &Services::simulated(), None).await {
        Ok(orchestrator) => {
            info!(
                "Pipeline OK: {} task(s), {} layer(s), answer in '{}'",
                orchestrator.graph().len(),
                orchestrator.plan().len(),
                orchestrator
                    .output_field()
                    .map(|f| f.as_str())
                    .unwrap_or("-")
            );
            info!(
                "Concurrency {}, deadline {:?}, failure policy {:?}",
                config.orchestrator.max_concurrent_tasks,
                config.orchestrator.deadline(),
                config.orchestrator.failure_policy
            );
            Ok(())
        }
        Err(e) => {
            error!("Pipeline invalid: {}", e);
            Err(e.into())
        }
    }
}
