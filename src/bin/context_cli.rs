//! Runtime CLI: `ingest`, `monitor`, `migrate`.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use context_runtime::admin::MigrateInfo;
use context_runtime::cae;
use context_runtime::{
    runtime_init, AdminClient, ContextInterface, PoolId, RuntimeConfig, RuntimeMode,
};

#[derive(Parser)]
#[command(name = "context_cli")]
#[command(about = "Context runtime control: ingest, monitor, migrate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose client logging.
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a transfer manifest and schedule assimilation tasks.
    Ingest {
        /// Path to the manifest YAML file.
        manifest: Option<std::path::PathBuf>,
    },
    /// Print the per-worker scheduler report.
    Monitor {
        /// Seconds between reports.
        #[arg(long, short, default_value_t = 1)]
        interval: u64,
        /// Report once and exit.
        #[arg(long, short)]
        once: bool,
        /// Emit one JSON object per tick instead of the table.
        #[arg(long, short)]
        json: bool,
    },
    /// Migrate a container to a different node.
    Migrate {
        /// Pool id in major.minor form, e.g. 200.0.
        #[arg(long = "pool-id")]
        pool_id: Option<String>,
        #[arg(long = "container-id")]
        container_id: Option<u32>,
        #[arg(long = "node-id")]
        node_id: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("info")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Usage errors do not need a runtime attachment.
    match &cli.command {
        Commands::Ingest { manifest: None } => {
            eprintln!("usage: context_cli ingest <manifest.yaml>");
            return ExitCode::FAILURE;
        }
        Commands::Migrate {
            pool_id,
            container_id,
            node_id,
        } if pool_id.is_none() || container_id.is_none() || node_id.is_none() => {
            eprintln!("missing required arguments");
            eprintln!(
                "usage: context_cli migrate --pool-id <major.minor> --container-id <CID> --node-id <NID>"
            );
            return ExitCode::FAILURE;
        }
        _ => {}
    }

    let ctx = match runtime_init(RuntimeMode::Client, RuntimeConfig::from_env()) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("failed to initialize client: {err}");
            eprintln!("is the context runtime running?");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Ingest { manifest } => cmd_ingest(ctx, &manifest.expect("validated above")),
        Commands::Monitor {
            interval,
            once,
            json,
        } => cmd_monitor(ctx, interval.max(1), once, json),
        Commands::Migrate {
            pool_id,
            container_id,
            node_id,
        } => cmd_migrate(
            ctx,
            &pool_id.expect("validated above"),
            container_id.expect("validated above"),
            node_id.expect("validated above"),
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn cmd_ingest(
    ctx: Arc<context_runtime::ContextClient>,
    manifest: &std::path::Path,
) -> anyhow::Result<()> {
    let entries = cae::load_manifest(manifest)?;
    tracing::info!(
        manifest = %manifest.display(),
        transfers = entries.len(),
        "manifest loaded"
    );
    let interface = ContextInterface::new(ctx)?;
    let scheduled = interface.context_bundle(entries)?;
    println!("Tasks scheduled: {scheduled}");
    Ok(())
}

fn cmd_monitor(
    ctx: Arc<context_runtime::ContextClient>,
    interval: u64,
    once: bool,
    json: bool,
) -> anyhow::Result<()> {
    let admin = AdminClient::new(ctx);
    loop {
        let report = admin.system_monitor()?;
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print_report(&report);
        }
        if once {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(interval));
    }
}

fn print_report(report: &context_runtime::admin::SystemMonitorResult) {
    // Clear screen for a live view, like a tiny top(1).
    print!("\x1b[2J\x1b[H");
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    println!("{}", "==================================================".dimmed());
    println!("        {}", "Context Runtime Worker Monitor".bold());
    println!("        {now}");
    println!("{}", "==================================================".dimmed());
    println!();

    let total_queued: u64 = report.workers.iter().map(|w| w.num_queued_tasks).sum();
    let total_blocked: u64 = report.workers.iter().map(|w| w.num_blocked_tasks).sum();
    let total_periodic: u64 = report.workers.iter().map(|w| w.num_periodic_tasks).sum();
    println!("Summary:");
    println!("  Total Workers:        {}", report.workers.len());
    println!("  Total Queued Tasks:   {total_queued}");
    println!("  Total Blocked Tasks:  {total_blocked}");
    println!("  Total Periodic Tasks: {total_periodic}");
    println!();

    println!("Worker Details:");
    println!(
        "{:>6} {:>9} {:>8} {:>12} {:>8} {:>9} {:>10} {:>14}",
        "ID", "Running", "Active", "Idle Iters", "Queued", "Blocked", "Periodic", "Suspend (us)"
    );
    println!("{}", "-".repeat(83));
    for worker in &report.workers {
        println!(
            "{:>6} {:>9} {:>8} {:>12} {:>8} {:>9} {:>10} {:>14}",
            worker.worker_id,
            if worker.is_running { "Yes" } else { "No" },
            if worker.is_active { "Yes" } else { "No" },
            worker.idle_iterations,
            worker.num_queued_tasks,
            worker.num_blocked_tasks,
            worker.num_periodic_tasks,
            worker.suspend_period_us,
        );
    }
    println!();
    println!("{}", "Press Ctrl+C to exit".dimmed());
}

fn cmd_migrate(
    ctx: Arc<context_runtime::ContextClient>,
    pool_id: &str,
    container_id: u32,
    node_id: u32,
) -> anyhow::Result<()> {
    let pool = PoolId::parse(pool_id)
        .ok_or_else(|| anyhow::anyhow!("--pool-id must be major.minor, e.g. 200.0"))?;
    let admin = AdminClient::new(ctx);
    tracing::info!(%pool, container_id, node_id, "requesting migration");
    let result = admin.migrate_containers(vec![MigrateInfo {
        pool,
        container_id,
        dest_node: node_id,
    }])?;
    if let Some(diagnostic) = &result.diagnostic {
        anyhow::bail!("migration failed: {diagnostic}");
    }
    println!(
        "{} migrated {} container(s)",
        "success:".green().bold(),
        result.num_migrated
    );
    Ok(())
}
