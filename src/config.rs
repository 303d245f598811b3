//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments
//!
//! Every section has serde defaults, so a missing or partial file is
//! always usable. The per-subsystem config types live next to the
//! subsystems they configure and are aggregated here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::animate::AnimationConfig;
use crate::channel::ChannelConfig;
use crate::predict::PredictionConfig;
use crate::throttle::ThrottleConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Push channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Marker animation configuration
    #[serde(default)]
    pub animation: AnimationConfig,
    /// Dead-reckoning configuration
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Update throttling configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Snapshot configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the one-time connection-status baseline comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// JSON snapshot document path (none = empty baseline)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("pretty", "compact", "json")
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path (None = console only)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.channel
            .endpoint
            .parse::<SocketAddr>()
            .context("Invalid push endpoint")?;

        if self.channel.event_buffer == 0 {
            anyhow::bail!("event_buffer must be at least 1");
        }

        if self.animation.duration_ms == 0 {
            anyhow::bail!("animation duration_ms must be non-zero");
        }

        if self.animation.frame_interval_ms == 0
            || self.animation.frame_interval_ms > self.animation.duration_ms
        {
            anyhow::bail!(
                "frame_interval_ms ({}) must be non-zero and at most duration_ms ({})",
                self.animation.frame_interval_ms,
                self.animation.duration_ms
            );
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        endpoint: Option<String>,
        snapshot: Option<PathBuf>,
    ) -> Self {
        if let Some(endpoint) = endpoint {
            self.channel.endpoint = endpoint;
        }
        if let Some(snapshot) = snapshot {
            self.snapshot.path = Some(snapshot);
        }
        self
    }
}
