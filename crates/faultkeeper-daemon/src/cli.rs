//! Command-line arguments and the merge with file configuration.
//!
//! CLI flags win over the config file; a missing `--config` flag falls
//! back to compiled defaults, while a named-but-broken file is a startup
//! error.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use faultkeeper_core::FaultkeeperConfig;

#[derive(Debug, Parser)]
#[command(
    name = "faultkeeper",
    version,
    about = "Keeps chaos-testing proxies converged with the shared control store"
)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the control database path.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Override the Toxiproxy control endpoint.
    #[arg(long)]
    pub toxiproxy_url: Option<String>,

    /// Log filter directive (overrides RUST_LOG).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Override the reconciliation poll interval (e.g. "250ms").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Override the health endpoint port.
    #[arg(long)]
    pub health_port: Option<u16>,

    /// Disable the health endpoint.
    #[arg(long)]
    pub no_health: bool,
}

/// Loads the config file (or defaults) and applies CLI overrides.
///
/// # Errors
///
/// Returns an error when a named config file cannot be read or parsed.
pub fn load_config(args: &Args) -> anyhow::Result<FaultkeeperConfig> {
    let mut config = match &args.config {
        Some(path) => FaultkeeperConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FaultkeeperConfig::default(),
    };

    if let Some(path) = &args.db_path {
        config.daemon.db_path.clone_from(path);
    }
    if let Some(url) = &args.toxiproxy_url {
        config.daemon.toxiproxy_url.clone_from(url);
    }
    if let Some(interval) = args.poll_interval {
        config.daemon.poll_interval = interval;
    }
    if let Some(port) = args.health_port {
        config.daemon.health_port = port;
    }
    Ok(config)
}
