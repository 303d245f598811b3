//! Telemetry Error Types
//!
//! Error taxonomy for the telemetry core. Expected failure modes are
//! values, not panics: transport errors are retried by the channel,
//! reconnect exhaustion is terminal for one channel instance only, and
//! malformed payloads never surface here at all (they are classified as
//! unknown events and logged).

use thiserror::Error;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Telemetry core error types
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Transport-level connection error (refused, timeout, mid-session drop)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconnection attempts exhausted; caller must reconnect explicitly
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Channel is not in a state that allows the operation
    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    /// Channel closed while an operation was in flight
    #[error("Channel closed")]
    ChannelClosed,

    /// Snapshot source failed; registry proceeds with empty baseline
    #[error("Snapshot fetch failed: {0}")]
    Snapshot(String),

    /// IO error from the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON on the wire
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TelemetryError {
    /// Whether the channel retries this error automatically.
    ///
    /// Transport and IO failures feed the reconnection loop; everything
    /// else is surfaced to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}
