use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lingai::{serve, setup_logging, spawn_line_reader};
use lingai_config::WorkerConfig;
use lingai_engine::{ComputeEngine, SimulatedEngine};
use log::info;

/// LingAI model worker: JSON Lines on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "lingai_worker", version, about)]
struct Args {
    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(file) = &args.log_file {
        config.log_file = Some(file.display().to_string());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    setup_logging(
        config.log_level_filter()?,
        config.log_file.as_deref().map(std::path::Path::new),
    )
    .context("failed to set up logging")?;

    info!(
        "[WORKER] Starting model worker process (pid={})",
        std::process::id()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let engine: Arc<dyn ComputeEngine> = Arc::new(SimulatedEngine::new(config.simulation.clone()));
    let summary = runtime.block_on(async {
        let frames = spawn_line_reader(io::BufReader::new(io::stdin()));
        serve(engine, &config, frames, io::stdout()).await
    })?;

    info!(
        "[WORKER] Exiting after {} requests, {} responses",
        summary.frames_received, summary.responses_written
    );
    Ok(())
}
