//! Telemetry push-channel management
//!
//! Owns the persistent push connection to the telemetry provider:
//! connect/subscribe/reconnect/disconnect lifecycle, exposed to consumers
//! as a typed event stream plus watchable connection state.
//!
//! # State machine
//!
//! ```text
//! Idle ──connect()──> Connecting ──ok──> Connected
//!                          │                 │ transport lost
//!                          │ error           v
//!                          └───────> Reconnecting ──retry ok──> Connected
//!                                        │ attempts exhausted
//!                                        v
//!                                      Failed   (terminal; caller must
//!                                                call connect() again)
//!
//! disconnect() from any state ──> Disconnected (pending timers cancelled)
//! ```
//!
//! Reconnection uses a fixed delay (1000 ms) and a maximum retry count
//! (5). A successful reconnection resets the attempt counter. Transport
//! errors surface as [`ChannelEvent::Error`] values; nothing in here
//! panics on network failure.
//!
//! The [`MultiDeviceChannel`] variant shares one transport session across
//! N device subscriptions and demultiplexes delivery per device.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TelemetryError;

mod multi;
mod transport;

pub use multi::{DeviceSubscription, MultiDeviceChannel};
pub use transport::{TcpJsonTransport, Transport, TransportEvent, TransportSession};

/// Connection state of one channel instance. Owned by the channel,
/// read-only to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never connected
    Idle,
    /// First connection attempt in progress
    Connecting,
    /// Session up, events flowing
    Connected,
    /// Transport lost, retrying on a fixed delay
    Reconnecting,
    /// Retries exhausted; terminal until `connect()` is called again
    Failed,
    /// Explicitly disconnected by the consumer
    Disconnected,
}

/// A typed event emitted by a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Subscription established (also after a successful reconnect)
    Connect,
    /// Transport lost; reconnection may follow
    Disconnect {
        /// Loss reason
        reason: String,
    },
    /// Transport error; terminal only when the state is [`ChannelState::Failed`]
    Error {
        /// Error description
        message: String,
    },
    /// Raw telemetry packet, not yet classified
    Packet {
        /// Device the packet belongs to
        device_id: String,
        /// Loosely-typed payload
        payload: Value,
    },
}

/// Configuration for channel reconnection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Push endpoint (`host:port` for the TCP transport)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Fixed delay between reconnection attempts (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Retries after a lost/failed connection before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Bounded event queue size per subscriber
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_endpoint() -> String {
    "127.0.0.1:5055".to_string()
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_event_buffer() -> usize {
    64
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            retry_delay_ms: default_retry_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Single-device telemetry channel.
///
/// One channel owns one subscription. `connect()` returns the event
/// stream for that subscription; calling it again tears down any running
/// session first (the terminal [`ChannelState::Failed`] state is left by
/// exactly this call).
pub struct TelemetryChannel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    attempts_tx: watch::Sender<u32>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TelemetryChannel {
    /// Create a channel over the given transport.
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        let (attempts_tx, _) = watch::channel(0);
        Self {
            transport,
            config,
            state_tx,
            attempts_tx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Open the subscription for `device_id` and return its event stream.
    ///
    /// Valid from any state; a running session is cancelled first.
    pub fn connect(&mut self, device_id: &str) -> mpsc::Receiver<ChannelEvent> {
        self.shutdown_task();

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let worker = ChannelWorker {
            transport: self.transport.clone(),
            device_ids: vec![device_id.to_owned()],
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
            max_attempts: self.config.max_reconnect_attempts,
            state_tx: self.state_tx.clone(),
            attempts_tx: self.attempts_tx.clone(),
            events_tx,
            cancel,
        };

        info!(device_id, "telemetry channel connecting");
        self.task = Some(tokio::spawn(worker.run()));
        events_rx
    }

    /// Release the subscription and cancel any pending reconnection
    /// timer. Valid from any state.
    pub fn disconnect(&mut self) {
        self.shutdown_task();
        self.state_tx.send_replace(ChannelState::Disconnected);
        debug!("telemetry channel disconnected");
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Current reconnection attempt counter (0 while connected).
    pub fn reconnect_attempts(&self) -> u32 {
        *self.attempts_tx.borrow()
    }

    /// Watch the reconnection attempt counter.
    pub fn attempts_watch(&self) -> watch::Receiver<u32> {
        self.attempts_tx.subscribe()
    }

    fn shutdown_task(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.shutdown_task();
    }
}

/// The connect/reconnect loop shared by channel variants.
pub(crate) struct ChannelWorker {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) device_ids: Vec<String>,
    pub(crate) retry_delay: Duration,
    pub(crate) max_attempts: u32,
    pub(crate) state_tx: watch::Sender<ChannelState>,
    pub(crate) attempts_tx: watch::Sender<u32>,
    pub(crate) events_tx: mpsc::Sender<ChannelEvent>,
    pub(crate) cancel: CancellationToken,
}

/// Why one connected session ended.
enum SessionEnd {
    /// Transport lost; the reconnect policy decides what happens next
    Lost(String),
    /// Consumer cancelled or went away; stop the loop
    Stop,
}

impl ChannelWorker {
    pub(crate) async fn run(mut self) {
        let mut attempts: u32 = 0;
        self.state_tx.send_replace(ChannelState::Connecting);

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state_tx.send_replace(ChannelState::Disconnected);
                    return;
                }
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(mut session) => match self.open_session(&mut session).await {
                    Ok(()) => {
                        attempts = 0;
                        self.attempts_tx.send_replace(0);
                        self.state_tx.send_replace(ChannelState::Connected);
                        if self.emit(ChannelEvent::Connect).await.is_err() {
                            session.close().await;
                            self.state_tx.send_replace(ChannelState::Disconnected);
                            return;
                        }

                        match self.pump(&mut session).await {
                            SessionEnd::Lost(reason) => {
                                warn!(reason, "push channel lost");
                                let _ = self.emit(ChannelEvent::Disconnect { reason }).await;
                            }
                            SessionEnd::Stop => {
                                session.close().await;
                                self.state_tx.send_replace(ChannelState::Disconnected);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        session.close().await;
                        let _ = self
                            .emit(ChannelEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "transport connect failed");
                    let _ = self
                        .emit(ChannelEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }

            // Reconnection policy: fixed delay, bounded retries
            attempts += 1;
            if attempts > self.max_attempts {
                let error = TelemetryError::ReconnectExhausted {
                    attempts: self.max_attempts,
                };
                warn!(%error, "giving up on push channel");
                self.state_tx.send_replace(ChannelState::Failed);
                let _ = self
                    .emit(ChannelEvent::Error {
                        message: error.to_string(),
                    })
                    .await;
                return;
            }

            self.attempts_tx.send_replace(attempts);
            self.state_tx.send_replace(ChannelState::Reconnecting);
            debug!(attempt = attempts, max = self.max_attempts, "reconnecting");

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state_tx.send_replace(ChannelState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Subscribe all member devices on a fresh session.
    async fn open_session(
        &self,
        session: &mut Box<dyn TransportSession>,
    ) -> crate::error::Result<()> {
        for device_id in &self.device_ids {
            session.join(device_id).await?;
        }
        Ok(())
    }

    /// Forward session events until the transport drops or the consumer
    /// goes away.
    async fn pump(&mut self, session: &mut Box<dyn TransportSession>) -> SessionEnd {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stop,
                event = session.next_event() => event,
            };

            let forwarded = match event {
                Some(TransportEvent::Packet { device_id, payload }) => {
                    self.emit(ChannelEvent::Packet { device_id, payload }).await
                }
                Some(TransportEvent::Error { message }) => {
                    self.emit(ChannelEvent::Error { message }).await
                }
                Some(TransportEvent::Connected) => Ok(()),
                Some(TransportEvent::Disconnected { reason }) => {
                    return SessionEnd::Lost(reason)
                }
                None => return SessionEnd::Lost("stream closed by peer".into()),
            };

            if forwarded.is_err() {
                // Consumer dropped the receiver: subscription is over
                return SessionEnd::Stop;
            }
        }
    }

    async fn emit(
        &self,
        event: ChannelEvent,
    ) -> std::result::Result<(), mpsc::error::SendError<ChannelEvent>> {
        self.events_tx.send(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted transport: each `connect()` consumes the next outcome.
    pub(super) struct FakeTransport {
        outcomes: Mutex<VecDeque<ConnectOutcome>>,
        pub(super) connects: AtomicU32,
    }

    pub(super) enum ConnectOutcome {
        Refused,
        /// Deliver these events, then end the stream (peer close)
        Session(Vec<TransportEvent>),
        /// Deliver these events, then block until cancelled
        SessionThenHold(Vec<TransportEvent>),
    }

    impl FakeTransport {
        pub(super) fn new(outcomes: Vec<ConnectOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                connects: AtomicU32::new(0),
            })
        }

        pub(super) fn always_refused() -> Arc<Self> {
            // More outcomes than any test will consume
            Self::new((0..32).map(|_| ConnectOutcome::Refused).collect())
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> crate::error::Result<Box<dyn TransportSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().pop_front() {
                Some(ConnectOutcome::Refused) | None => Err(TelemetryError::Transport(
                    "connection refused".into(),
                )),
                Some(ConnectOutcome::Session(events)) => Ok(Box::new(FakeSession {
                    events: events.into(),
                    hold_open: false,
                    joined: Vec::new(),
                })),
                Some(ConnectOutcome::SessionThenHold(events)) => Ok(Box::new(FakeSession {
                    events: events.into(),
                    hold_open: true,
                    joined: Vec::new(),
                })),
            }
        }
    }

    struct FakeSession {
        events: VecDeque<TransportEvent>,
        hold_open: bool,
        joined: Vec<String>,
    }

    #[async_trait]
    impl TransportSession for FakeSession {
        async fn join(&mut self, device_id: &str) -> crate::error::Result<()> {
            self.joined.push(device_id.to_owned());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            match self.events.pop_front() {
                Some(event) => Some(event),
                None if self.hold_open => {
                    // Stay open until the channel cancels us
                    std::future::pending().await
                }
                None => None,
            }
        }

        async fn close(&mut self) {}
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            retry_delay_ms: 1000,
            max_reconnect_attempts: 5,
            ..ChannelConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_delivers_packets() {
        let transport = FakeTransport::new(vec![ConnectOutcome::SessionThenHold(vec![
            TransportEvent::Packet {
                device_id: "865468050102444".into(),
                payload: json!({ "type": "login" }),
            },
        ])]);

        let mut channel = TelemetryChannel::new(transport, fast_config());
        let mut events = channel.connect("865468050102444");

        assert!(matches!(events.recv().await, Some(ChannelEvent::Connect)));
        match events.recv().await {
            Some(ChannelEvent::Packet { device_id, payload }) => {
                assert_eq!(device_id, "865468050102444");
                assert_eq!(payload["type"], "login");
            }
            other => panic!("expected Packet, got {:?}", other),
        }
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_retries() {
        let transport = FakeTransport::always_refused();
        let mut channel = TelemetryChannel::new(transport.clone(), fast_config());
        let mut events = channel.connect("dev");

        let mut state = channel.state_watch();
        state
            .wait_for(|s| *s == ChannelState::Failed)
            .await
            .unwrap();

        // 1 initial attempt + 5 retries, never a 6th retry
        assert_eq!(transport.connects.load(Ordering::SeqCst), 6);

        // Terminal error surfaced on the stream after 6 transport errors
        let mut terminal = None;
        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Error { message } = event {
                terminal = Some(message);
            }
        }
        assert_eq!(
            terminal.as_deref(),
            Some("Reconnection failed after 5 attempts")
        );

        // Failed is terminal: no further attempts on their own
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 6);
        assert_eq!(channel.state(), ChannelState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_attempts() {
        let transport = FakeTransport::new(vec![
            // First session drops immediately
            ConnectOutcome::Session(vec![]),
            // Two refused retries
            ConnectOutcome::Refused,
            ConnectOutcome::Refused,
            // Then the session comes back and stays
            ConnectOutcome::SessionThenHold(vec![]),
        ]);

        let mut channel = TelemetryChannel::new(transport, fast_config());
        let mut events = channel.connect("dev");
        let mut attempts = channel.attempts_watch();

        assert!(matches!(events.recv().await, Some(ChannelEvent::Connect)));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnect { .. })
        ));

        // Attempt counter climbs during the retry storm...
        attempts.wait_for(|n| *n >= 3).await.unwrap();

        // ...and the second Connect means it reset
        let mut state = channel.state_watch();
        state
            .wait_for(|s| *s == ChannelState::Connected)
            .await
            .unwrap();
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let transport = FakeTransport::always_refused();
        let mut channel = TelemetryChannel::new(transport.clone(), fast_config());
        let _events = channel.connect("dev");

        // Let the first attempt fail and the retry timer start
        let mut attempts = channel.attempts_watch();
        attempts.wait_for(|n| *n >= 1).await.unwrap();
        let connects_before = transport.connects.load(Ordering::SeqCst);

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // The pending retry never fires
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), connects_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_events_not_panics() {
        let transport = FakeTransport::new(vec![
            ConnectOutcome::Refused,
            ConnectOutcome::SessionThenHold(vec![TransportEvent::Error {
                message: "garbled frame".into(),
            }]),
        ]);

        let mut channel = TelemetryChannel::new(transport, fast_config());
        let mut events = channel.connect("dev");

        // Refused connect surfaces as a non-fatal error event
        match events.recv().await {
            Some(ChannelEvent::Error { message }) => {
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected Error, got {:?}", other),
        }

        // Then the channel recovers and forwards the in-session error
        assert!(matches!(events.recv().await, Some(ChannelEvent::Connect)));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Error { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Connected);
    }
}
