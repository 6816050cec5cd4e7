//! CLI binary for running and inspecting Folio book pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use folio_pipeline::{
    default_pipeline, default_registry, DryRunGenerator, EngineConfig, ExecutionPlan,
    PipelineEngine, StepRegistry,
};
use folio_types::FolioError;

#[derive(Parser)]
#[command(name = "folio", version, about = "Resumable, parallel book-generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Flags that override values from the config file.
#[derive(clap::Args)]
struct EngineArgs {
    /// Config file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for the checkpoint and the compiled book
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum number of concurrent steps
    #[arg(long)]
    workers: Option<usize>,

    /// Run steps one at a time
    #[arg(long)]
    sequential: bool,

    /// Attempts per step, including the first
    #[arg(long)]
    max_retries: Option<u32>,

    /// Comma-separated subset of steps to run, in order
    #[arg(long, value_delimiter = ',')]
    steps: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a book on a topic
    Run {
        /// Book topic; also identifies the job and its checkpoint
        topic: String,

        /// Resume from the checkpoint in the output directory
        #[arg(long)]
        resume: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Show the execution plan without running anything
    Plan {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// List the registered steps and the default pipeline
    Steps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            topic,
            resume,
            engine,
        } => {
            cmd_run(&topic, resume, &engine).await?;
        }
        Commands::Plan { engine } => {
            cmd_plan(&engine).await?;
        }
        Commands::Steps => {
            cmd_steps();
        }
    }

    Ok(())
}

fn registry() -> StepRegistry {
    default_registry(Arc::new(DryRunGenerator))
}

async fn load_config(args: &EngineArgs) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load_or_default(args.config.as_deref()).await;
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if args.sequential {
        config.parallel_enabled = false;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(steps) = &args.steps {
        let steps: Vec<String> = steps
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        config.agent_sequence = Some(steps);
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_run(topic: &str, resume: bool, args: &EngineArgs) -> anyhow::Result<()> {
    let config = load_config(args).await?;
    let output_dir = config.output_dir.clone();
    let engine = PipelineEngine::from_registry(&registry(), config)?;

    println!("Generating: {topic}");
    println!("Output: {}", output_dir.display());
    println!("(offline generator -- placeholder content)");
    if resume {
        println!("Resuming from checkpoint if present");
    }

    let phases = engine.events().macro_steps().len();
    engine.events().on_step_change(topic.trim(), move |change| {
        println!("[{}/{}] {}", change.index + 1, phases, change.macro_step);
    });

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current attempt");
            cancel.cancel();
        }
    });

    let result = match engine.run(topic, resume).await {
        Ok(result) => result,
        Err(FolioError::Cancelled) => {
            println!("\nInterrupted. Progress is checkpointed; rerun with --resume to continue.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let book = result.state.get_str("compiled_book");
    if !book.is_empty() {
        let path = write_book(&output_dir, book)?;
        println!("\nBook written to {}", path.display());
    }

    println!("Completed steps: {:?}", result.state.completed_steps);
    if !result.skipped.is_empty() {
        println!("Skipped: {:?}", result.skipped);
    }
    if result.state.revision_rounds > 0 {
        println!("Revision rounds: {}", result.state.revision_rounds);
    }
    if let Some(report) = result.state.get("quality_report") {
        println!("Quality report: {}", serde_json::to_string_pretty(report)?);
    }
    if !result.state.warnings.is_empty() {
        println!("Warnings: {}", result.state.warnings.len());
    }
    println!("Errors: {}", result.error_count());
    for error in &result.state.errors {
        println!("  - {error}");
    }
    println!("Finished in {:.1}s", result.duration.as_secs_f64());

    Ok(())
}

fn write_book(output_dir: &Path, book: &str) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("book.md");
    std::fs::write(&path, book)?;
    Ok(path)
}

async fn cmd_plan(args: &EngineArgs) -> anyhow::Result<()> {
    let config = load_config(args).await?;
    let engine = PipelineEngine::from_registry(&registry(), config)?;

    match engine.plan()? {
        ExecutionPlan::Linear(units) => {
            println!("Sequential plan ({} steps):", units.len());
            for (i, unit) in units.iter().enumerate() {
                println!("  {}. {}", i + 1, unit.name);
            }
        }
        ExecutionPlan::Batches(batches) => {
            println!(
                "Parallel plan ({} batches, up to {} workers):",
                batches.len(),
                engine.config().max_workers
            );
            for (i, batch) in batches.iter().enumerate() {
                let names: Vec<&str> = batch.iter().map(|u| u.name.as_str()).collect();
                println!("  {}. {}", i + 1, names.join(", "));
            }
        }
    }
    if let Some(gate) = engine.quality_gate() {
        println!(
            "Quality gate after '{}': threshold {:.2}, up to {} revisions",
            gate.review_step, gate.threshold, gate.max_revisions
        );
    }

    Ok(())
}

fn cmd_steps() {
    let registry = registry();
    println!("Registered steps: {}", registry.names().join(", "));
    println!("\nDefault pipeline:");
    for descriptor in default_pipeline() {
        if descriptor.dependencies.is_empty() {
            println!("  {}", descriptor.name);
        } else {
            println!("  {} <- {}", descriptor.name, descriptor.dependencies.join(", "));
        }
    }
}
