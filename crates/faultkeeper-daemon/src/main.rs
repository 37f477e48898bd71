//! faultkeeper daemon entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use faultkeeper_core::{
    ControlStore, FaultInjector, Reconciler, ReconcilerConfig, ToxiproxyClient,
};
use faultkeeper_daemon::cli::{Args, load_config};
use faultkeeper_daemon::health;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        },
    }
    Ok(())
}

/// Flips the shutdown flag on the first SIGTERM or SIGINT.
async fn watch_signals(shutdown: Arc<AtomicBool>) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        },
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    shutdown.store(true, Ordering::SeqCst);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = load_config(&args)?;
    info!(
        db_path = %config.daemon.db_path.display(),
        toxiproxy_url = %config.daemon.toxiproxy_url,
        "starting faultkeeper"
    );

    if let Some(parent) = config.daemon.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let store = ControlStore::open(&config.daemon.db_path)
        .with_context(|| format!("failed to open {}", config.daemon.db_path.display()))?;
    let client =
        ToxiproxyClient::new(&config.daemon.toxiproxy_url).context("failed to build client")?;
    let injector = FaultInjector::new(Arc::new(client), config.retry);

    let engine_config = ReconcilerConfig::default()
        .with_poll_interval(config.daemon.poll_interval)
        .with_max_consecutive_failures(config.daemon.max_consecutive_failures);
    let reconciler = Reconciler::new(
        store,
        injector,
        config.catalog(),
        config.retry,
        engine_config,
    );

    tokio::spawn(watch_signals(reconciler.shutdown_handle()));

    if !args.no_health {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.daemon.health_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
        tokio::spawn(async move {
            if let Err(e) = health::serve(listener).await {
                error!(error = %e, "health endpoint failed");
            }
        });
    }

    let reason = reconciler.run().await.context("reconciliation failed")?;
    info!(?reason, "faultkeeper exiting");
    Ok(())
}
