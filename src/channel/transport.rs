//! Transport abstraction for the push channel
//!
//! The channel state machine never talks to a socket directly: it drives
//! a [`Transport`] that opens [`TransportSession`]s. Production use gets
//! a newline-delimited-JSON TCP implementation; tests inject scripted
//! fakes. One transport object owns one logical endpoint, with explicit
//! open/close lifecycle, no module-level singletons.
//!
//! # Wire format (TCP transport)
//!
//! One JSON object per line:
//! - outbound subscribe: `{"join": {"deviceId": "<imei>"}}`
//! - inbound packet: `{"deviceId": "<imei>", "data": { ... }}` (the
//!   `data` payload is loosely typed; see [`crate::events`])
//!
//! Malformed lines surface as [`TransportEvent::Error`] and never kill
//! the session.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::error::{Result, TelemetryError};

/// An event surfaced by a transport session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Transport-level session (re)established
    Connected,
    /// Transport lost; the channel decides whether to reconnect
    Disconnected {
        /// Human-readable loss reason
        reason: String,
    },
    /// Non-fatal transport error (malformed frame, write failure)
    Error {
        /// Error description
        message: String,
    },
    /// Raw telemetry packet for one device
    Packet {
        /// Device the packet belongs to
        device_id: String,
        /// Loosely-typed payload, classified downstream
        payload: Value,
    },
}

/// Factory for transport sessions against one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session. Connection-level failures are returned as
    /// [`TelemetryError::Transport`], never panics.
    async fn connect(&self) -> Result<Box<dyn TransportSession>>;
}

/// One open push-channel session.
#[async_trait]
pub trait TransportSession: Send {
    /// Subscribe to a device's event stream.
    async fn join(&mut self, device_id: &str) -> Result<()>;

    /// Next event from the session; `None` once the peer closed the
    /// stream (treated as a disconnect by the channel).
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Close the session and release the socket.
    async fn close(&mut self);
}

// =============================================================================
// TCP line-delimited JSON transport
// =============================================================================

/// TCP transport speaking newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct TcpJsonTransport {
    endpoint: String,
}

impl TcpJsonTransport {
    /// Create a transport for `host:port`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for TcpJsonTransport {
    async fn connect(&self) -> Result<Box<dyn TransportSession>> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| TelemetryError::Transport(format!("{}: {}", self.endpoint, e)))?;
        debug!(endpoint = %self.endpoint, "transport connected");
        Ok(Box::new(TcpJsonSession {
            framed: Some(Framed::new(stream, LinesCodec::new())),
        }))
    }
}

struct TcpJsonSession {
    framed: Option<Framed<TcpStream, LinesCodec>>,
}

#[async_trait]
impl TransportSession for TcpJsonSession {
    async fn join(&mut self, device_id: &str) -> Result<()> {
        let framed = self
            .framed
            .as_mut()
            .ok_or(TelemetryError::ChannelClosed)?;
        let line = json!({ "join": { "deviceId": device_id } }).to_string();
        framed
            .send(line)
            .await
            .map_err(|e| TelemetryError::Transport(format!("join failed: {}", e)))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        let framed = self.framed.as_mut()?;
        match framed.next().await {
            Some(Ok(line)) => Some(parse_line(&line)),
            Some(Err(e)) => Some(TransportEvent::Disconnected {
                reason: e.to_string(),
            }),
            None => None,
        }
    }

    async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            // LinesCodec encodes any AsRef<str>, so the sink item type
            // must be pinned down explicitly
            let _ = SinkExt::<String>::close(&mut framed).await;
        }
    }
}

/// Parse one inbound line into a transport event.
fn parse_line(line: &str) -> TransportEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "malformed frame on push channel");
            return TransportEvent::Error {
                message: format!("malformed frame: {}", e),
            };
        }
    };

    let device_id = value
        .get("deviceId")
        .or_else(|| value.get("imei"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    match device_id {
        Some(device_id) => {
            let payload = value.get("data").cloned().unwrap_or(value);
            TransportEvent::Packet { device_id, payload }
        }
        None => {
            warn!("frame without device identifier dropped");
            TransportEvent::Error {
                message: "frame without device identifier".into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_packet_line() {
        let event = parse_line(
            r#"{"deviceId": "865468050102444", "data": {"type": "login"}}"#,
        );
        match event {
            TransportEvent::Packet { device_id, payload } => {
                assert_eq!(device_id, "865468050102444");
                assert_eq!(payload["type"], "login");
            }
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_imei_alias_and_flat_payload() {
        // Some providers send the payload flattened next to the id
        let event = parse_line(r#"{"imei": "123", "lat": 1.0, "lng": 2.0}"#);
        match event {
            TransportEvent::Packet { device_id, payload } => {
                assert_eq!(device_id, "123");
                assert_eq!(payload["lat"], 1.0);
            }
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_line_is_error_not_panic() {
        assert!(matches!(
            parse_line("not json"),
            TransportEvent::Error { .. }
        ));
        assert!(matches!(
            parse_line(r#"{"data": {"type": "login"}}"#),
            TransportEvent::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_join_and_close_over_live_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            framed.next().await
        });

        let transport = TcpJsonTransport::new(addr.to_string());
        let mut session = transport.connect().await.unwrap();
        session.join("865468050102444").await.unwrap();
        session.close().await;
        session.close().await; // idempotent once the sink is gone

        let line = peer.await.unwrap().unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["join"]["deviceId"], "865468050102444");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Port 9 (discard) is almost certainly closed on loopback
        let transport = TcpJsonTransport::new("127.0.0.1:9");
        match transport.connect().await {
            Err(TelemetryError::Transport(_)) => {}
            Ok(_) => {} // a listener actually exists; nothing to assert
            Err(other) => panic!("expected Transport error, got {:?}", other),
        }
    }
}
