//! Connection Registry
//!
//! Reconciles the one-time authoritative snapshot with the continuous
//! stream of push events into a single per-device connection state.
//!
//! # Reconciliation policy
//!
//! - Events win: the snapshot only ever seeds devices that no live event
//!   has touched yet. A stale snapshot arriving after the first event for
//!   a device must not overwrite it.
//! - Last-applied-wins: the registry applies events in delivery order and
//!   does not reorder by timestamp. If the transport reorders events,
//!   state may regress; `last_transition_at` is recorded for
//!   observability, not sequencing.
//! - Unrecognized payloads are inert: no state change, counted and logged
//!   at debug level, never an error.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::events::{DeviceStatus, Snapshot, TelemetryEvent};

/// Authoritative connection state for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConnectionState {
    /// Stable device identifier (IMEI)
    pub device_id: String,
    /// Current connectivity status
    pub status: DeviceStatus,
    /// Provider-supplied reason for the last disconnection
    pub disconnection_reason: Option<String>,
    /// When the state last changed (seed or event application time)
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceEntry {
    state: DeviceConnectionState,
    /// Whether a live event has ever touched this entry. Seeding skips
    /// touched entries.
    touched_by_event: bool,
}

/// Registry statistics for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Devices with known state
    pub devices: usize,
    /// Events applied that changed or confirmed state
    pub events_applied: u64,
    /// Events that matched no recognition rule
    pub events_unrecognized: u64,
    /// Snapshot entries skipped because an event arrived first
    pub seeds_skipped: u64,
}

/// Per-device connection state, combining snapshot baseline and push
/// events.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<String, DeviceEntry>,
    events_applied: u64,
    events_unrecognized: u64,
    seeds_skipped: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install baseline state from the one-time snapshot.
    ///
    /// Only devices never touched by a live event are seeded; everything
    /// else keeps its event-derived state.
    pub fn seed(&mut self, snapshot: &Snapshot) {
        let now = Utc::now();
        for device in &snapshot.devices {
            match self.entries.get(&device.imei) {
                Some(entry) if entry.touched_by_event => {
                    self.seeds_skipped += 1;
                    trace!(
                        device_id = %device.imei,
                        "snapshot entry skipped, live event arrived first"
                    );
                }
                _ => {
                    self.entries.insert(
                        device.imei.clone(),
                        DeviceEntry {
                            state: DeviceConnectionState {
                                device_id: device.imei.clone(),
                                status: device.status,
                                disconnection_reason: device.disconnection_reason.clone(),
                                last_transition_at: now,
                            },
                            touched_by_event: false,
                        },
                    );
                }
            }
        }
        debug!(
            devices = self.entries.len(),
            skipped = self.seeds_skipped,
            "registry seeded from snapshot"
        );
    }

    /// Apply a classified channel event to one device's state.
    ///
    /// Connectivity events transition the device; position and unknown
    /// events leave state untouched (unknowns are counted).
    pub fn apply(&mut self, device_id: &str, event: &TelemetryEvent) {
        let (status, reason) = match event {
            TelemetryEvent::Connected => (DeviceStatus::Connected, None),
            TelemetryEvent::Disconnected { reason } => {
                (DeviceStatus::Disconnected, reason.clone())
            }
            TelemetryEvent::Position(_) => return,
            TelemetryEvent::Unknown => {
                self.events_unrecognized += 1;
                debug!(device_id, "unrecognized telemetry payload ignored");
                return;
            }
        };

        let now = Utc::now();
        let entry = self
            .entries
            .entry(device_id.to_owned())
            .or_insert_with(|| DeviceEntry {
                state: DeviceConnectionState {
                    device_id: device_id.to_owned(),
                    status,
                    disconnection_reason: reason.clone(),
                    last_transition_at: now,
                },
                touched_by_event: true,
            });

        entry.state.status = status;
        entry.state.disconnection_reason = reason;
        entry.state.last_transition_at = now;
        entry.touched_by_event = true;
        self.events_applied += 1;

        trace!(device_id, status = ?status, "connection state applied");
    }

    /// Current state for a device; `None` until the snapshot or first
    /// event arrives.
    pub fn get(&self, device_id: &str) -> Option<&DeviceConnectionState> {
        self.entries.get(device_id).map(|entry| &entry.state)
    }

    /// Iterate over all known device states.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceConnectionState> {
        self.entries.values().map(|entry| &entry.state)
    }

    /// Registry statistics.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            devices: self.entries.len(),
            events_applied: self.events_applied,
            events_unrecognized: self.events_unrecognized,
            seeds_skipped: self.seeds_skipped,
        }
    }
}
