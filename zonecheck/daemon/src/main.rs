//! Zonecheck - zone lookup daemon and operational CLI
//!
//! Runs the zone service in the foreground (keeping the dataset fresh and
//! sweeping rate-limit windows) or performs one operational command and
//! exits.
//!
//! # Usage
//!
//! ```bash
//! # Keep the cache warm until SIGINT/SIGTERM
//! zonecheck serve
//!
//! # One-off lookup
//! zonecheck check --lat 40.7128 --lon -74.0060
//!
//! # Dataset operations
//! zonecheck warm
//! zonecheck refresh
//! zonecheck invalidate
//!
//! # Metrics as JSON
//! zonecheck status
//!
//! # Explicit config and verbose logging
//! zonecheck --config /etc/zonecheck/zonecheck.toml --log-level debug status
//! RUST_LOG=zonecheck_core=trace zonecheck serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop background tasks and exit

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use zonecheck_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ZoneCheckConfigFile, ZoneService,
};

/// Zonecheck - point-in-zone lookups over a refreshed GeoJSON dataset
#[derive(Parser, Debug)]
#[command(name = "zonecheck")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ZONECHECK_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "ZONECHECK_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    /// Dataset URL (overrides config and environment)
    #[arg(long, value_name = "URL", global = true)]
    source_url: Option<String>,

    /// Dataset file (overrides config and environment)
    #[arg(long, value_name = "FILE", global = true, conflicts_with = "source_url")]
    source_file: Option<PathBuf>,

    /// Shared store URL, `redis://...` or `memory://`
    #[arg(long, value_name = "URL", global = true)]
    store_url: Option<String>,

    /// Prefer the remote query service
    #[arg(long, global = true)]
    prefer_remote: bool,

    #[command(subcommand)]
    command: Command,
}

/// Operations
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Warm up and keep the dataset fresh until interrupted
    Serve,

    /// Check whether a point lies in a zone
    Check {
        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Caller identity for rate limiting
        #[arg(long, default_value = "web-app")]
        identity: String,

        /// Give up after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Load the dataset (from the shared store when available)
    Warm,

    /// Reload the dataset from its source
    Refresh,

    /// Print cache, backend and rate-limit metrics as JSON
    Status,

    /// Drop the cached dataset and its shared copy
    Invalidate,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.source_url {
            overrides = overrides.with_source_url(url.clone());
        }
        if let Some(path) = &self.source_file {
            overrides = overrides.with_source_file(path.clone());
        }
        if let Some(url) = &self.store_url {
            overrides = overrides.with_store_url(url.clone());
        }
        if self.prefer_remote {
            overrides = overrides.with_use_remote_service(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("zonecheck={level},zonecheck_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load file and environment configuration, then apply CLI overrides
fn build_config(args: &Args) -> Result<ZoneCheckConfigFile> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Zonecheck starting"
    );

    let config = build_config(&args)?;
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        "Configuration loaded"
    );

    let service = ZoneService::from_config(config).context("Failed to build zone service")?;

    let result = match args.command {
        Command::Serve => commands::serve(&service).await,
        Command::Check {
            lat,
            lon,
            identity,
            timeout_ms,
        } => commands::check(&service, &identity, lat, lon, timeout_ms).await,
        Command::Warm => commands::warm(&service).await,
        Command::Refresh => commands::refresh(&service).await,
        Command::Status => commands::status(&service),
        Command::Invalidate => commands::invalidate(&service).await,
    };

    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }
    result
}
