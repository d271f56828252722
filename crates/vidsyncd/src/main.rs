//! vidsyncd: footage ingestion worker
//!
//! Usage:
//!   vidsyncd [--config /etc/vidsync/vidsync.toml] [--log info] [--log-format json|text]
//!
//! Hosts the sync, merge and stabilize worker pools, the control API with its
//! event stream, and the Prometheus endpoint.

mod api;
mod daemon;
mod handlers;
mod metrics;
mod publisher;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use vidsync_core::config::VidsyncConfig;

#[derive(Parser, Debug)]
#[command(name = "vidsyncd", version, about = "vidsync footage ingestion worker")]
struct Cli {
    /// Path to vidsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "VIDSYNC_CONFIG",
        default_value = "/etc/vidsync/vidsync.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "VIDSYNC_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon] log_format
    #[arg(long, env = "VIDSYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first so its log settings apply; a missing file is reported once logging is up
    let (config, missing) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            LogFormat::Json
        }
    });
    init_logging(&level, &format);

    if missing {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "vidsyncd starting"
    );

    daemon::run(config).await
}

/// Returns the config and whether the file was missing.
async fn load_config(path: &Path) -> Result<(VidsyncConfig, bool)> {
    if !path.exists() {
        return Ok((VidsyncConfig::default(), true));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, false))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
