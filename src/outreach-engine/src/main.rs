//! Outreach Engine: multi-step outreach sequence automation.
//!
//! Main entry point: loads configuration, restores the last snapshot, starts
//! the scheduler workers and serves the REST API until shutdown.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use outreach_api::{ApiServer, AppState};
use outreach_channels::ChannelRouter;
use outreach_core::config::AppConfig;
use outreach_sequence::persistence::SnapshotFile;
use outreach_sequence::scheduler::{SchedulerPool, SchedulerSettings};
use outreach_sequence::SequenceEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "outreach-engine")]
#[command(about = "Multi-step outreach sequence automation engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); environment variables still override it
    #[arg(long, short = 'c', env = "OUTREACH_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Number of scheduler workers (overrides config)
    #[arg(long, env = "OUTREACH__SCHEDULER__WORKERS")]
    workers: Option<usize>,

    /// Serve the API without running scheduler workers
    #[arg(long, default_value_t = false)]
    api_only: bool,

    /// Publish the stock demo sequences when the registry is empty
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "outreach_engine=info,outreach_sequence=info,outreach_api=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach engine starting up");

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(Some(path.as_str()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.workers = workers;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        workers = config.scheduler.workers,
        snapshot = ?config.persistence.snapshot_path,
        "Configuration loaded"
    );

    // Engine state, restored from the last snapshot when persistence is on.
    let engine = SequenceEngine::new();
    let snapshots = config
        .persistence
        .snapshot_path
        .as_ref()
        .map(SnapshotFile::new);
    if let Some(file) = &snapshots {
        if let Some(snapshot) = file.load()? {
            engine.restore(snapshot);
        }
    }
    if cli.seed_demo && engine.registry().list().is_empty() {
        engine.seed_demo_sequences()?;
    }

    let (channels, email, tasks) = ChannelRouter::standard(&config.channels);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = if config.scheduler.enabled && !cli.api_only {
        let scheduler = Arc::new(
            engine.scheduler(Arc::new(channels), SchedulerSettings::from(&config)),
        );
        Some(SchedulerPool::start(
            scheduler,
            config.scheduler.workers.max(1),
            Duration::from_millis(config.scheduler.poll_interval_ms.max(10)),
            Duration::from_secs(config.scheduler.maintenance_interval_secs.max(1)),
        ))
    } else {
        info!("Running in API-only mode (no scheduler workers)");
        None
    };

    let snapshot_task = snapshots.clone().map(|file| {
        spawn_snapshots(
            engine.clone(),
            file,
            Duration::from_secs(config.persistence.snapshot_interval_secs.max(1)),
            shutdown_rx.clone(),
        )
    });

    let state = AppState::new(&config, engine.clone(), email, tasks);
    let idempotency_task = spawn_idempotency_purge(state.clone(), shutdown_rx.clone());

    let api_server = ApiServer::new(config.clone(), state.clone());
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Outreach engine is ready to serve traffic");

    // Blocks until a shutdown signal arrives and in-flight requests drain.
    let draining = state.clone();
    api_server
        .start_http(async move {
            shutdown_signal().await;
            draining.set_ready(false);
            info!("Shutdown signal received, draining");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    for task in [snapshot_task, Some(idempotency_task)].into_iter().flatten() {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    if let Some(file) = &snapshots {
        file.save(&engine.snapshot())?;
        info!(path = %file.path().display(), "Final snapshot written");
    }

    info!("Outreach engine stopped");
    Ok(())
}

fn spawn_snapshots(
    engine: SequenceEngine,
    file: SnapshotFile,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing has changed yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    let file = file.clone();
                    let saved = tokio::task::spawn_blocking(move || file.save(&engine.snapshot())).await;
                    match saved {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "Periodic snapshot failed"),
                        Err(e) => error!(error = %e, "Snapshot task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_idempotency_purge(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = state.idempotency.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired idempotency keys purged");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
