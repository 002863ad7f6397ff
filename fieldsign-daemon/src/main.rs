//! FieldSign Sync Daemon
//!
//! Owns the device's signature queue and drains it to the server whenever
//! the server is reachable. Captured signatures stay on the device until the
//! server acknowledges them.

use clap::Parser;
use fieldsign_core::sync::HttpUploadClient;
use fieldsign_core::{
    platform, Enrollment, FieldSignConfig, QueueHandle, SignatureQueue, SyncEngine, SystemClock,
};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMAND_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "fieldsign-daemon", about = "FieldSign background sync daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = platform::get_default_config_path())]
    config: PathBuf,

    /// Server URL override
    #[arg(short, long)]
    server_url: Option<String>,

    /// Queue database path override
    #[arg(short, long)]
    queue_path: Option<PathBuf>,

    /// Enrollment file path override
    #[arg(short, long)]
    enrollment: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        FieldSignConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        FieldSignConfig::default()
    };

    if let Some(server_url) = cli.server_url {
        cfg.server_url = server_url;
    }
    if let Some(queue_path) = cli.queue_path {
        cfg.queue_path = queue_path;
    }
    if let Some(enrollment) = cli.enrollment {
        cfg.enrollment_path = enrollment;
    }
    cfg.validate()?;

    tracing::info!("Starting FieldSign daemon v{}", VERSION);

    if !cfg.enrollment_path.exists() {
        anyhow::bail!(
            "Device is not enrolled: {} not found",
            cfg.enrollment_path.display()
        );
    }
    let enrollment = Enrollment::load(&cfg.enrollment_path)?;

    if let Some(parent) = cfg.queue_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let queue = SignatureQueue::open(&cfg.queue_path)?.with_max_queue_bytes(cfg.max_queue_bytes);
    let stats = queue.stats()?;
    tracing::info!(
        depth = stats.depth,
        pending = stats.pending_count,
        needs_attention = stats.needs_attention,
        "Opened queue at {}",
        cfg.queue_path.display()
    );

    let api = HttpUploadClient::new(
        &cfg.server_url,
        enrollment.device_id(),
        cfg.request_timeout(),
    )?;
    let engine = SyncEngine::new(
        queue,
        api,
        enrollment.key(),
        SystemClock,
        cfg.sync_settings(),
    );

    let mut phase = engine.subscribe();
    tokio::spawn(async move {
        while phase.changed().await.is_ok() {
            let current = *phase.borrow();
            tracing::debug!(?current, "Engine phase");
        }
    });

    let (connectivity, signal_rx) = watch::channel(true);
    watch_connectivity_signals(connectivity)?;
    let (handle, commands) = QueueHandle::channel(COMMAND_CAPACITY);
    let engine_task = tokio::spawn(engine.run(commands, signal_rx));

    tracing::info!("Syncing to {}", cfg.server_url);

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    handle.shutdown().await?;
    let queue = engine_task.await?;
    let stats = queue.stats()?;
    tracing::info!(
        depth = stats.depth,
        pending = stats.pending_count,
        "Daemon stopped"
    );

    Ok(())
}

/// SIGUSR1 marks the device offline, SIGUSR2 online. The network manager
/// hooks on the device send these.
#[cfg(unix)]
fn watch_connectivity_signals(tx: watch::Sender<bool>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut offline = signal(SignalKind::user_defined1())?;
    let mut online = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = offline.recv() => {
                    tracing::info!("Connectivity: offline");
                    tx.send_replace(false);
                }
                Some(()) = online.recv() => {
                    tracing::info!("Connectivity: online");
                    tx.send_replace(true);
                }
                else => break,
            }
        }
    });
    Ok(())
}

/// Without a platform signal the last value sticks and the engine's probe
/// alone decides reachability.
#[cfg(not(unix))]
fn watch_connectivity_signals(_tx: watch::Sender<bool>) -> anyhow::Result<()> {
    Ok(())
}
