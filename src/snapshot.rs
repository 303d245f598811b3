//! Snapshot Source Abstraction
//!
//! The authoritative baseline is fetched once per device set at startup.
//! How it is fetched is a host concern (most deployments front the GPS
//! provider with their own REST proxy), so the coordinator consumes it
//! through a trait. The crate ships a JSON-file source for demos and
//! tests.
//!
//! A failed fetch is not fatal: the registry proceeds with an empty
//! baseline and devices stay unknown until a live event establishes
//! state.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Result, TelemetryError};
use crate::events::Snapshot;

/// Source of the one-time authoritative device snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the snapshot for the configured device set.
    async fn fetch(&self) -> Result<Snapshot>;
}

/// Snapshot source reading a JSON document from disk.
///
/// Document shape: `{ "devices": [{ "imei", "status", "disconnectionReason"? }] }`.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotSource {
    path: PathBuf,
}

impl JsonFileSnapshotSource {
    /// Create a source for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSnapshotSource {
    async fn fetch(&self) -> Result<Snapshot> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| TelemetryError::Snapshot(format!("{}: {}", self.path.display(), e)))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| TelemetryError::Snapshot(format!("{}: {}", self.path.display(), e)))?;
        debug!(
            path = %self.path.display(),
            devices = snapshot.devices.len(),
            "snapshot loaded"
        );
        Ok(snapshot)
    }
}

/// Source that always reports an empty device set. Used when no snapshot
/// endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct EmptySnapshotSource;

#[async_trait]
impl SnapshotSource for EmptySnapshotSource {
    async fn fetch(&self) -> Result<Snapshot> {
        Ok(Snapshot::default())
    }
}
