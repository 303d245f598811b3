//! Multi-device channel with a shared transport session
//!
//! One transport session subscribes to N device identifiers. Membership
//! can grow and shrink without tearing down the transport; connection
//! state (Connected/Reconnecting/Failed) is shared across all
//! subscriptions, but packet delivery is demultiplexed per device.
//! The transport is torn down only when the last subscriber leaves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::{Transport, TransportEvent, TransportSession};
use super::{ChannelConfig, ChannelEvent, ChannelState};
use crate::error::TelemetryError;

type SubscriberMap = Arc<Mutex<HashMap<String, mpsc::Sender<ChannelEvent>>>>;

/// One device's view of a shared channel.
pub struct DeviceSubscription {
    /// Subscribed device identifier
    pub device_id: String,
    /// Demultiplexed event stream for this device (connectivity events
    /// are broadcast to every subscription)
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Commands into the running session loop.
enum Command {
    /// Send a join frame for a device added while connected
    Join(String),
}

/// Telemetry channel sharing one transport session across N devices.
pub struct MultiDeviceChannel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    subscribers: SubscriberMap,
    state_tx: watch::Sender<ChannelState>,
    attempts_tx: watch::Sender<u32>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MultiDeviceChannel {
    /// Create a channel over the given transport. No connection is
    /// opened until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        let (attempts_tx, _) = watch::channel(0);
        Self {
            transport,
            config,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            state_tx,
            attempts_tx,
            cmd_tx: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Add a device to the shared subscription.
    ///
    /// If the session is live, a join frame goes out without touching the
    /// transport; otherwise the device is joined on the next (re)connect.
    pub fn subscribe(&mut self, device_id: &str) -> DeviceSubscription {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        self.subscribers.lock().insert(device_id.to_owned(), tx);

        if let Some(cmd_tx) = &self.cmd_tx {
            // Session loop may have just exited; the membership map is
            // authoritative either way
            let _ = cmd_tx.try_send(Command::Join(device_id.to_owned()));
        }

        debug!(device_id, "device subscribed");
        DeviceSubscription {
            device_id: device_id.to_owned(),
            events: rx,
        }
    }

    /// Remove a device from the shared subscription. Tears down the
    /// transport only when this was the last subscriber.
    pub fn unsubscribe(&mut self, device_id: &str) {
        let now_empty = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(device_id);
            subscribers.is_empty()
        };
        debug!(device_id, now_empty, "device unsubscribed");

        if now_empty {
            self.disconnect();
        }
    }

    /// Open the shared session and start delivering events.
    pub fn connect(&mut self) {
        self.shutdown_task();

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        self.cmd_tx = Some(cmd_tx);
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let worker = MultiWorker {
            transport: self.transport.clone(),
            subscribers: self.subscribers.clone(),
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
            max_attempts: self.config.max_reconnect_attempts,
            state_tx: self.state_tx.clone(),
            attempts_tx: self.attempts_tx.clone(),
            cmd_rx,
            cancel,
        };

        info!(
            devices = self.subscribers.lock().len(),
            "multi-device channel connecting"
        );
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Tear down the shared transport and cancel pending timers. Valid
    /// from any state.
    pub fn disconnect(&mut self) {
        self.shutdown_task();
        self.state_tx.send_replace(ChannelState::Disconnected);
        debug!("multi-device channel disconnected");
    }

    /// Current shared connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Watch shared connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Current reconnection attempt counter.
    pub fn reconnect_attempts(&self) -> u32 {
        *self.attempts_tx.borrow()
    }

    /// Number of subscribed devices.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn shutdown_task(&mut self) {
        self.cancel.cancel();
        self.cmd_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MultiDeviceChannel {
    fn drop(&mut self) {
        self.shutdown_task();
    }
}

struct MultiWorker {
    transport: Arc<dyn Transport>,
    subscribers: SubscriberMap,
    retry_delay: Duration,
    max_attempts: u32,
    state_tx: watch::Sender<ChannelState>,
    attempts_tx: watch::Sender<u32>,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

enum SessionEnd {
    Lost(String),
    Stop,
}

impl MultiWorker {
    async fn run(mut self) {
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
                Ok(mut session) => {
                    // Joins queued while disconnected are covered by the
                    // membership snapshot taken next; drain them before
                    // reading the map so a join that races in afterwards
                    // stays queued and replays live. A duplicate join
                    // frame is harmless.
                    while self.cmd_rx.try_recv().is_ok() {}

                    match self.join_members(&mut session).await {
                        Ok(()) => {
                            attempts = 0;
                            self.attempts_tx.send_replace(0);
                            self.state_tx.send_replace(ChannelState::Connected);
                            self.broadcast(ChannelEvent::Connect).await;

                            match self.pump(&mut session).await {
                                SessionEnd::Lost(reason) => {
                                    warn!(reason, "shared push channel lost");
                                    self.broadcast(ChannelEvent::Disconnect { reason }).await;
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
                            self.broadcast(ChannelEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "transport connect failed");
                    self.broadcast(ChannelEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                }
            }

            attempts += 1;
            if attempts > self.max_attempts {
                let error = TelemetryError::ReconnectExhausted {
                    attempts: self.max_attempts,
                };
                warn!(%error, "giving up on shared push channel");
                self.state_tx.send_replace(ChannelState::Failed);
                self.broadcast(ChannelEvent::Error {
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

    /// Join every currently subscribed device on a fresh session.
    async fn join_members(
        &self,
        session: &mut Box<dyn TransportSession>,
    ) -> crate::error::Result<()> {
        let members: Vec<String> = self.subscribers.lock().keys().cloned().collect();
        for device_id in members {
            session.join(&device_id).await?;
        }
        Ok(())
    }

    async fn pump(&mut self, session: &mut Box<dyn TransportSession>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stop,

                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Join(device_id)) => {
                            // Membership grows without touching the transport
                            if let Err(e) = session.join(&device_id).await {
                                warn!(device_id, error = %e, "live join failed");
                            }
                        }
                        None => return SessionEnd::Stop,
                    }
                }

                event = session.next_event() => {
                    match event {
                        Some(TransportEvent::Packet { device_id, payload }) => {
                            self.deliver(&device_id, payload).await;
                        }
                        Some(TransportEvent::Error { message }) => {
                            self.broadcast(ChannelEvent::Error { message }).await;
                        }
                        Some(TransportEvent::Connected) => {}
                        Some(TransportEvent::Disconnected { reason }) => {
                            return SessionEnd::Lost(reason);
                        }
                        None => return SessionEnd::Lost("stream closed by peer".into()),
                    }

                    if self.subscribers.lock().is_empty() {
                        // Last subscriber is gone; no reason to keep the
                        // transport alive
                        return SessionEnd::Stop;
                    }
                }
            }
        }
    }

    /// Deliver a packet to exactly its device's subscriber.
    async fn deliver(&self, device_id: &str, payload: serde_json::Value) {
        let sender = self.subscribers.lock().get(device_id).cloned();
        match sender {
            Some(sender) => {
                let event = ChannelEvent::Packet {
                    device_id: device_id.to_owned(),
                    payload,
                };
                if sender.send(event).await.is_err() {
                    // Receiver dropped without unsubscribing
                    self.subscribers.lock().remove(device_id);
                    debug!(device_id, "subscriber dropped, removed from demux");
                }
            }
            None => {
                trace!(device_id, "packet for unsubscribed device dropped");
            }
        }
    }

    /// Send a connectivity event to every subscription.
    async fn broadcast(&self, event: ChannelEvent) {
        let senders: Vec<(String, mpsc::Sender<ChannelEvent>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        for (device_id, sender) in senders {
            if sender.send(event.clone()).await.is_err() {
                self.subscribers.lock().remove(&device_id);
                debug!(device_id, "subscriber dropped, removed from demux");
            }
        }
    }
}
