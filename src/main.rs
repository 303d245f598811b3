//! tracklink - device-location telemetry daemon
//!
//! Entry point for the daemon binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracklink::channel::TcpJsonTransport;
use tracklink::config::Config;
use tracklink::coordinator::AnimationCoordinator;
use tracklink::snapshot::{EmptySnapshotSource, JsonFileSnapshotSource, SnapshotSource};

/// Command-line arguments for tracklink
#[derive(Parser, Debug)]
#[command(name = "tracklink")]
#[command(version, about = "Device-location telemetry daemon", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tracklink/config.toml")]
    pub config: String,

    /// Push endpoint (host:port)
    #[arg(short, long, env = "TRACKLINK_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Device identifiers (IMEIs) to track
    #[arg(short, long = "device", env = "TRACKLINK_DEVICES", value_delimiter = ',', required = true)]
    pub devices: Vec<String>,

    /// Snapshot JSON document path
    #[arg(short, long, env = "TRACKLINK_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("════════════════════════════════════════════════════════");
    info!("  tracklink v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    // Load configuration
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Override config with CLI args
    let config = config.with_overrides(args.endpoint.clone(), args.snapshot.clone());
    config.validate()?;

    info!("Configuration loaded successfully");
    tracing::debug!("Config: {:?}", config);

    let transport = Arc::new(TcpJsonTransport::new(config.channel.endpoint.clone()));
    let snapshot_source: Arc<dyn SnapshotSource> = match &config.snapshot.path {
        Some(path) => Arc::new(JsonFileSnapshotSource::new(path.clone())),
        None => Arc::new(EmptySnapshotSource),
    };

    let mut coordinator = AnimationCoordinator::new(transport, snapshot_source, &config);
    for device_id in &args.devices {
        coordinator.track(device_id);
    }

    info!(
        endpoint = %config.channel.endpoint,
        devices = args.devices.len(),
        "starting telemetry coordinator"
    );
    coordinator.start().await;

    // Periodic state report until ctrl-c
    let mut report = tokio::time::interval(std::time::Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for device_id in &args.devices {
                    let view = coordinator.view(device_id);
                    tracing::debug!(
                        device_id,
                        state = ?coordinator.channel_state(),
                        status = ?view.connection.as_ref().map(|c| c.status),
                        position = ?view.position,
                        "device view"
                    );
                }
            }
        }
    }

    info!("shutting down");
    coordinator.shutdown();
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use std::fs::File;

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tracklink={level},warn", level = log_level))
    });

    // If log file is specified, write to both stdout and file
    if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path)?;

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path);
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
        }
    }

    Ok(())
}
