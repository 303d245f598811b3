//! Telemetry event classification
//!
//! Inbound packets are loosely-typed JSON objects whose shape varies by
//! upstream provider. Classification happens exactly once, at the channel
//! boundary: a raw payload is parsed into one of four tags and everything
//! downstream dispatches on the tag, never on raw field presence.
//!
//! # Recognized shapes
//!
//! | Payload                                   | Tag            |
//! |-------------------------------------------|----------------|
//! | `type` ∈ {connection, reconnection, login}| `Connected`    |
//! | `type` == disconnection (+ `reason`?)     | `Disconnected` |
//! | `status` == "connected" (no `type`)       | `Connected`    |
//! | `status` == "disconnected" (no `type`, + `reason`?) | `Disconnected` |
//! | `latitude`/`lat` + `longitude`/`lng`      | `Position`     |
//! | anything else                             | `Unknown`      |
//!
//! Position payloads accept field aliases (`lat`, `lng`, `speed_kmh`,
//! `ts`); speed is normalized to m/s here so the predictor only ever
//! sees one unit.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geo::GeoPoint;

/// Connectivity status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device session is up
    Connected,
    /// Device session is down
    Disconnected,
}

/// A position observation extracted from a telemetry packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    /// Observed coordinate
    pub position: GeoPoint,
    /// Ground speed in m/s, if reported
    pub speed: Option<f64>,
    /// Course over ground in degrees, if reported
    pub course: Option<f64>,
    /// Observation timestamp, if reported (epoch milliseconds on the wire)
    pub timestamp: Option<DateTime<Utc>>,
}

/// A classified telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Device reported connected (connection/reconnection/login, or
    /// `status: "connected"`)
    Connected,
    /// Device reported disconnected, with the provider's reason if given
    Disconnected {
        /// Provider-supplied disconnection reason
        reason: Option<String>,
    },
    /// Position observation
    Position(PositionUpdate),
    /// Unrecognized shape; inert for state, counted for observability
    Unknown,
}

impl TelemetryEvent {
    /// Classify a raw payload. Never fails: unmatched shapes become
    /// [`TelemetryEvent::Unknown`].
    pub fn classify(payload: &Value) -> Self {
        let kind = payload.get("type").and_then(Value::as_str);
        if let Some(kind) = kind {
            match kind {
                "connection" | "reconnection" | "login" => return Self::Connected,
                "disconnection" => {
                    return Self::Disconnected {
                        reason: string_field(payload, "reason"),
                    }
                }
                _ => {}
            }
        }

        // The status rule only applies when no `type` discriminator is
        // present at all; an unrecognized `type` must not be reinterpreted
        // through an incidental `status` field
        if kind.is_none() {
            if let Some(status) = payload.get("status").and_then(Value::as_str) {
                match status {
                    "connected" => return Self::Connected,
                    "disconnected" => {
                        return Self::Disconnected {
                            reason: string_field(payload, "reason"),
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(update) = parse_position(payload) {
            return Self::Position(update);
        }

        Self::Unknown
    }
}

fn parse_position(payload: &Value) -> Option<PositionUpdate> {
    let latitude = number_field(payload, &["latitude", "lat"])?;
    let longitude = number_field(payload, &["longitude", "lng"])?;

    let speed = number_field(payload, &["speed"])
        .or_else(|| number_field(payload, &["speed_kmh"]).map(|kmh| kmh / 3.6));

    let timestamp = number_field(payload, &["timestamp", "ts"])
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single());

    Some(PositionUpdate {
        position: GeoPoint::new(latitude, longitude),
        speed,
        course: number_field(payload, &["course"]),
        timestamp,
    })
}

/// First numeric value found under any of the aliases. Accepts numbers
/// and numeric strings (some providers quote everything).
fn number_field(payload: &Value, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|key| {
        let value = payload.get(*key)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    })
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_owned)
}

// =============================================================================
// Snapshot document
// =============================================================================

/// One device entry from the authoritative snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDevice {
    /// Stable device identifier (IMEI)
    pub imei: String,
    /// Connectivity status at snapshot time
    pub status: DeviceStatus,
    /// Disconnection reason, if the device was down
    #[serde(rename = "disconnectionReason", default)]
    pub disconnection_reason: Option<String>,
}

/// Snapshot document: the one-time baseline for the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// All devices known to the provider at fetch time
    #[serde(default)]
    pub devices: Vec<SnapshotDevice>,
}
