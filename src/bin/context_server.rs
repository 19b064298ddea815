//! Runtime server: hosts the shared segment and the worker scheduler
//! until `StopRuntime` or SIGINT.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use context_runtime::{runtime_init, RuntimeConfig, RuntimeMode};

#[derive(Parser)]
#[command(name = "context_server")]
#[command(about = "Start the context runtime server")]
struct Args {
    /// Optional YAML config file; environment variables override it.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Worker thread count override.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_yaml(path)?,
        None => RuntimeConfig::from_env(),
    };
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }

    let ctx = runtime_init(RuntimeMode::Server, config).context("failed to start runtime")?;
    let runtime = ctx
        .server()
        .cloned()
        .context("server mode did not produce a runtime")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        let sched = Arc::clone(runtime.sched());
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Release);
            sched.request_stop();
        })
        .context("failed to install signal handler")?;
    }

    runtime.wait_for_stop();
    tracing::info!(
        interrupted = interrupted.load(Ordering::Acquire),
        "runtime stopped"
    );
    Ok(())
}
