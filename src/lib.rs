//! # tracklink
//!
//! Device-location telemetry core: keeps a live map view of GPS tracker
//! devices from a push event stream plus a one-time REST-style snapshot.
//!
//! # Architecture
//!
//! ```text
//! tracklink
//!   ├─> Telemetry Channel (push connection, reconnection state machine)
//!   ├─> Connection Registry (snapshot baseline + live status events)
//!   ├─> Update Throttler (paces the position firehose)
//!   ├─> Position Predictor (dead-reckoning between real updates)
//!   ├─> Position Animator (smooth marker interpolation)
//!   └─> Animation Coordinator (wires all of the above together)
//! ```
//!
//! # Data Flow
//!
//! **Status Path:** Snapshot ∪ push events → Registry → connection views
//!
//! **Position Path:** push events → Throttler → Predictor/Animator → marker views

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Marker animation (easing, cooperative tick loop)
pub mod animate;

/// Push channel lifecycle and transports
pub mod channel;

/// Configuration loading and validation
pub mod config;

/// Event-loop wiring of channel, registry, predictor and animators
pub mod coordinator;

/// Crate-wide error type
pub mod error;

/// Loosely-typed payload classification into typed telemetry events
pub mod events;

/// Spherical geometry on the Earth mean radius
pub mod geo;

/// Dead-reckoning position prediction
pub mod predict;

/// Connection-status reconciliation
pub mod registry;

/// One-time device snapshot sources
pub mod snapshot;

/// Position update throttling
pub mod throttle;

pub use coordinator::{AnimationCoordinator, DeviceView};
pub use error::{Result, TelemetryError};
pub use geo::GeoPoint;
