use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hgr_config::{Config, ConfigWatcher};
use hgr_core::{
    init_logging, pack_directory, run_local, ControlPlane, DockerRuntime, Downloader,
    GracefulShutdown, ResourceLedger, Scheduler, Spool, Streams, Submission,
};
use hgr_types::{Arch, HangarError, Os, StopCause, Workload};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hangar", about = "Hangar - containerized workload node", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: fetch workloads and execute them one at a time
    Serve,
    /// Package a directory and submit it as a workload
    Enqueue(EnqueueArgs),
    /// Run a directory once in the foreground, attached to this terminal
    Run(RunArgs),
}

#[derive(Args)]
struct EnqueueArgs {
    /// Directory to package
    dir: PathBuf,
    /// Module path inside the directory
    #[arg(long)]
    entry: String,
    /// Time-to-live in milliseconds
    #[arg(long, default_value_t = 3_600_000)]
    ttl: u64,
    #[arg(long, default_value_t = 1)]
    cores: u32,
    /// Memory in bytes
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    memory: u64,
    #[arg(long, default_value_t = Arch::current())]
    arch: Arch,
    #[arg(long, default_value_t = Os::current())]
    os: Os,
    /// Allow the workload to share a node with others
    #[arg(long)]
    allow_shared: bool,
    #[arg(long, default_value = "")]
    vcs_uri: String,
}

#[derive(Args)]
struct RunArgs {
    /// Directory to run
    dir: PathBuf,
    /// Module path inside the directory
    #[arg(long)]
    entry: String,
    /// Time-to-live in milliseconds
    #[arg(long, default_value_t = 3_600_000)]
    ttl: u64,
    #[arg(long, default_value_t = 1)]
    cores: u32,
    /// Memory in bytes
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    memory: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Enqueue(args) => enqueue(config, args).await?,
        Commands::Run(args) => run(config, args).await?,
    }
    Ok(())
}

async fn serve(mut config: Config) -> anyhow::Result<()> {
    // 1. Init logging; the guard flushes the file writer on exit
    let _guard = init_logging(
        &config.log_level,
        Some(config.log_dir.join("hangar.log").as_path()),
        config.structured_logs(),
    );
    info!("Hangar starting...");

    // 2. Run the scheduler, restarting it on config reloads
    loop {
        let cause = run_node(config.clone()).await?;
        match cause.stop_cause() {
            Some(StopCause::Reload) => {
                info!("Reloading configuration");
                config = Config::reload().context("Failed to reload configuration")?;
            }
            Some(stop) => {
                info!(cause = %stop, "Hangar stopped.");
                return Ok(());
            }
            None => return Err(cause).context("Scheduler terminated"),
        }
    }
}

/// Wire up one scheduler instance and run it until it terminates.
async fn run_node(config: Config) -> anyhow::Result<HangarError> {
    config
        .create_directories()
        .context("Failed to create directories")?;
    info!(
        spool = %config.spool_dir.display(),
        control_plane = %config.control_plane_url,
        capacity = %config.node_limits(),
        "Configuration loaded"
    );

    let runtime = Arc::new(DockerRuntime::from_config(&config));
    if !runtime.check_available().await {
        warn!(docker = %config.docker_bin, "Docker is not available; workloads will fail to start");
    }

    let spool = Spool::open(&config.spool_dir).context("Failed to open spool")?;
    let ledger = Arc::new(ResourceLedger::new(config.node_limits()));
    let control_plane =
        Arc::new(ControlPlane::from_config(&config).context("Failed to build control plane client")?);
    let downloader = Arc::new(Downloader::from_config(
        &config,
        spool.clone(),
        control_plane.clone(),
        ledger.clone(),
    ));

    let shutdown = Arc::new(match config.run_deadline() {
        Some(deadline) => GracefulShutdown::with_deadline(deadline),
        None => GracefulShutdown::new(),
    });

    let mut watcher = ConfigWatcher::new();
    {
        let shutdown = shutdown.clone();
        watcher.on_change(move |path| {
            info!(file = %path.display(), "Requesting reload");
            shutdown.request_reload();
        });
    }
    if let Err(e) = watcher.start() {
        warn!(error = %e, "Config watcher unavailable");
    }

    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                error!(error = %e, "Signal handler failed");
            }
        })
    };

    let scheduler = Scheduler::new(
        config,
        spool,
        ledger,
        runtime,
        downloader,
        control_plane,
        shutdown,
    );
    info!("Hangar is running. Press Ctrl+C to stop.");
    let cause = scheduler.run().await;

    signals.abort();
    watcher.stop();
    Ok(cause)
}

async fn enqueue(config: Config, args: EnqueueArgs) -> anyhow::Result<()> {
    let _guard = init_logging(&config.log_level, None, config.structured_logs());

    let dir = args.dir.clone();
    let archive = tokio::task::spawn_blocking(move || pack_directory(&dir))
        .await
        .context("Packaging task failed")?
        .with_context(|| format!("Failed to package {}", args.dir.display()))?;

    let submission = Submission {
        entry: args.entry,
        allow_shared: args.allow_shared,
        ttl: args.ttl,
        cores: args.cores,
        memory: args.memory,
        arch: args.arch,
        os: args.os,
        vcs_uri: args.vcs_uri,
    };
    let control_plane =
        ControlPlane::from_config(&config).context("Failed to build control plane client")?;
    let id = control_plane
        .enqueue(submission, archive)
        .await
        .context("Failed to submit workload")?;

    println!("{id}");
    Ok(())
}

async fn run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let _guard = init_logging(&config.log_level, None, config.structured_logs());
    config
        .create_directories()
        .context("Failed to create directories")?;

    let workload = Workload {
        id: Uuid::new_v4(),
        entry: args.entry,
        ttl: args.ttl,
        cores: args.cores,
        memory: args.memory,
        arch: config.node_arch,
        os: config.node_os,
        allow_shared: false,
        vcs_uri: String::new(),
        account_id: String::new(),
        labels: BTreeSet::new(),
    };

    let runtime = Arc::new(DockerRuntime::from_config(&config));
    let shutdown = Arc::new(GracefulShutdown::new());
    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                error!(error = %e, "Signal handler failed");
            }
        })
    };

    let outcome = run_local(
        &config,
        runtime,
        &workload,
        &args.dir,
        Streams::stdio(),
        &shutdown,
    )
    .await;
    signals.abort();

    match outcome {
        Ok(()) => Ok(()),
        Err(HangarError::Workload { exit_code }) => {
            std::process::exit(i32::try_from(exit_code).unwrap_or(1))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to run {}", args.dir.display())),
    }
}
