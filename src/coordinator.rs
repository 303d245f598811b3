//! Animation Coordinator
//!
//! Composition layer wiring the push channel into the rendering-facing
//! state:
//!
//! ```text
//! SnapshotSource ──once──> ConnectionRegistry  <──status events──┐
//!                                                                │
//! MultiDeviceChannel ──packets──> classify ──┬───────────────────┘
//!                                            │ position events
//!                                            v
//!                              UpdateThrottler ──> PositionPredictor
//!                                            │           │
//!                                            v           v (between updates)
//!                                     PositionAnimator ──> rendered view
//! ```
//!
//! The external map renderer only ever reads [`DeviceView`]s: current
//! connection state, the interpolated marker coordinate, and a shake
//! signal raised when a confirmed position moved materially.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::animate::{AnimationConfig, AnimationOptions, PositionAnimator};
use crate::channel::{ChannelEvent, ChannelState, MultiDeviceChannel, Transport};
use crate::config::Config;
use crate::events::TelemetryEvent;
use crate::geo::{self, CompassDirection, GeoPoint};
use crate::predict::{PositionPredictor, PositionSample, PredictionConfig};
use crate::registry::{ConnectionRegistry, DeviceConnectionState};
use crate::snapshot::SnapshotSource;
use crate::throttle::{ThrottleConfig, UpdateThrottler};

/// A confirmed move larger than this (degrees, either axis) raises the
/// shake signal (~10 m).
pub const MATERIAL_MOVE_DEG: f64 = 1e-4;

/// What the renderer reads for one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceView {
    /// Reconciled connection state; `None` until snapshot or first event
    pub connection: Option<DeviceConnectionState>,
    /// Current interpolated marker coordinate
    pub position: Option<GeoPoint>,
    /// Travel direction of the last confirmed move, for the marker label
    pub direction: Option<CompassDirection>,
    /// Raised while the marker should play its "moved" animation
    pub should_shake: bool,
}

/// Rendered state shared with `view()` readers.
#[derive(Debug, Clone, Copy, Default)]
struct RenderState {
    position: Option<GeoPoint>,
    direction: Option<CompassDirection>,
    should_shake: bool,
}

/// Per-device pipeline state owned by the run loop.
struct DeviceRuntime {
    animator: PositionAnimator,
    throttler: UpdateThrottler,
    last_confirmed: Option<GeoPoint>,
    last_confirmed_at: Option<Instant>,
}

impl DeviceRuntime {
    fn new(animation: &AnimationConfig, throttle: &ThrottleConfig) -> Self {
        Self {
            animator: PositionAnimator::new(animation),
            throttler: UpdateThrottler::new(throttle.clone()),
            last_confirmed: None,
            last_confirmed_at: None,
        }
    }
}

/// Wires channel events into registry, predictor and animators, and
/// exposes per-device render views.
pub struct AnimationCoordinator {
    channel: MultiDeviceChannel,
    snapshot_source: Arc<dyn SnapshotSource>,
    registry: Arc<RwLock<ConnectionRegistry>>,
    render: Arc<RwLock<HashMap<String, RenderState>>>,
    animation: AnimationConfig,
    prediction: PredictionConfig,
    throttle: ThrottleConfig,
    device_ids: Vec<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AnimationCoordinator {
    /// Create a coordinator over the given transport and snapshot source.
    pub fn new(
        transport: Arc<dyn Transport>,
        snapshot_source: Arc<dyn SnapshotSource>,
        config: &Config,
    ) -> Self {
        Self {
            channel: MultiDeviceChannel::new(transport, config.channel.clone()),
            snapshot_source,
            registry: Arc::new(RwLock::new(ConnectionRegistry::new())),
            render: Arc::new(RwLock::new(HashMap::new())),
            animation: config.animation.clone(),
            prediction: config.prediction.clone(),
            throttle: config.throttle.clone(),
            device_ids: Vec::new(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Register a device to track. Call before [`start`](Self::start).
    pub fn track(&mut self, device_id: &str) {
        if !self.device_ids.iter().any(|id| id == device_id) {
            self.device_ids.push(device_id.to_owned());
        }
    }

    /// Seed the registry from the snapshot, open the shared channel and
    /// start the run loop.
    ///
    /// A failed snapshot fetch degrades to an empty baseline; it never
    /// fails the subsystem.
    pub async fn start(&mut self) {
        match self.snapshot_source.fetch().await {
            Ok(snapshot) => self.registry.write().seed(&snapshot),
            Err(e) => {
                warn!(error = %e, "snapshot unavailable, starting with empty baseline");
            }
        }

        // Merge all per-device streams into one loop input
        let (merged_tx, merged_rx) = mpsc::channel::<(String, ChannelEvent)>(256);
        for device_id in &self.device_ids {
            let mut subscription = self.channel.subscribe(device_id);
            let tx = merged_tx.clone();
            let id = subscription.device_id.clone();
            tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    if tx.send((id.clone(), event)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(merged_tx);

        self.channel.connect();

        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        let loop_state = CoordinatorLoop {
            registry: self.registry.clone(),
            render: self.render.clone(),
            devices: self
                .device_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        DeviceRuntime::new(&self.animation, &self.throttle),
                    )
                })
                .collect(),
            prediction: self.prediction.clone(),
            frame_interval: Duration::from_millis(self.animation.frame_interval_ms),
            merged_rx,
            cancel,
        };

        info!(devices = self.device_ids.len(), "coordinator started");
        self.task = Some(tokio::spawn(loop_state.run()));
    }

    /// Current render view for a device.
    pub fn view(&self, device_id: &str) -> DeviceView {
        let render = self
            .render
            .read()
            .get(device_id)
            .copied()
            .unwrap_or_default();
        DeviceView {
            connection: self.registry.read().get(device_id).cloned(),
            position: render.position,
            direction: render.direction,
            should_shake: render.should_shake,
        }
    }

    /// Reconciled connection state for a device.
    pub fn connection(&self, device_id: &str) -> Option<DeviceConnectionState> {
        self.registry.read().get(device_id).cloned()
    }

    /// Shared channel connection state.
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Stop tracking one device. Tears down the transport when it was
    /// the last one.
    pub fn untrack(&mut self, device_id: &str) {
        self.device_ids.retain(|id| id != device_id);
        self.channel.unsubscribe(device_id);
        self.render.write().remove(device_id);
    }

    /// Stop the run loop and release the channel.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.channel.disconnect();
        debug!("coordinator shut down");
    }
}

impl Drop for AnimationCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CoordinatorLoop {
    registry: Arc<RwLock<ConnectionRegistry>>,
    render: Arc<RwLock<HashMap<String, RenderState>>>,
    devices: HashMap<String, DeviceRuntime>,
    prediction: PredictionConfig,
    frame_interval: Duration,
    merged_rx: mpsc::Receiver<(String, ChannelEvent)>,
    cancel: CancellationToken,
}

impl CoordinatorLoop {
    async fn run(mut self) {
        let mut predictor = PositionPredictor::new();
        let mut frame = tokio::time::interval(self.frame_interval);
        frame.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.merged_rx.recv() => {
                    // tokio's clock so paused-clock tests stay deterministic
                    let now = tokio::time::Instant::now().into_std();
                    match event {
                        Some((device_id, event)) => {
                            self.handle_event(&device_id, event, &mut predictor, now);
                        }
                        None => break,
                    }
                }

                _ = frame.tick() => {
                    self.handle_frame(tokio::time::Instant::now().into_std(), &predictor);
                }
            }
        }
        debug!("coordinator loop ended");
    }

    fn handle_event(
        &mut self,
        device_id: &str,
        event: ChannelEvent,
        predictor: &mut PositionPredictor,
        now: Instant,
    ) {
        match event {
            ChannelEvent::Packet { payload, .. } => {
                let event = TelemetryEvent::classify(&payload);
                match &event {
                    TelemetryEvent::Position(update) => {
                        self.handle_position(device_id, update.clone(), predictor, now);
                    }
                    TelemetryEvent::Disconnected { .. } => {
                        // Device context changed: stale motion history
                        // must not feed predictions
                        predictor.clear(device_id);
                        self.registry.write().apply(device_id, &event);
                    }
                    _ => {
                        self.registry.write().apply(device_id, &event);
                    }
                }
            }
            ChannelEvent::Connect => {
                // Fresh session: let the first update through immediately
                if let Some(runtime) = self.devices.get_mut(device_id) {
                    runtime.throttler.force_next();
                }
            }
            ChannelEvent::Disconnect { reason } => {
                debug!(device_id, reason, "channel lost, clearing motion history");
                predictor.clear(device_id);
            }
            ChannelEvent::Error { message } => {
                warn!(device_id, message, "channel error");
            }
        }
    }

    fn handle_position(
        &mut self,
        device_id: &str,
        update: crate::events::PositionUpdate,
        predictor: &mut PositionPredictor,
        now: Instant,
    ) {
        let Some(runtime) = self.devices.get_mut(device_id) else {
            return;
        };

        if !runtime.throttler.should_update_at(now) {
            return;
        }

        let confirmed = update.position;
        let timestamp = update.timestamp.unwrap_or_else(chrono::Utc::now);
        predictor.add_position(
            device_id,
            PositionSample::new(confirmed, timestamp)
                .with_speed(update.speed)
                .with_course(update.course),
        );

        let material_move = match runtime.last_confirmed {
            Some(previous) => {
                (confirmed.latitude - previous.latitude).abs() > MATERIAL_MOVE_DEG
                    || (confirmed.longitude - previous.longitude).abs() > MATERIAL_MOVE_DEG
            }
            None => false,
        };

        match runtime
            .animator
            .current_position()
            .or(runtime.last_confirmed)
        {
            Some(from) => {
                runtime
                    .animator
                    .animate_at(from, confirmed, AnimationOptions::new(), now);
            }
            None => {
                // First fix: place the marker, nothing to animate
                self.render.write().entry(device_id.to_owned()).or_default().position =
                    Some(confirmed);
            }
        }

        // Reported course wins; otherwise derive heading from the move
        let heading = update.course.or_else(|| {
            runtime
                .last_confirmed
                .filter(|previous| !previous.approx_eq(&confirmed, 1e-9))
                .map(|previous| geo::bearing(&previous, &confirmed))
        });

        runtime.last_confirmed = Some(confirmed);
        runtime.last_confirmed_at = Some(now);

        let mut render = self.render.write();
        let state = render.entry(device_id.to_owned()).or_default();
        state.should_shake = material_move;
        if let Some(heading) = heading {
            state.direction = Some(geo::direction(heading));
        }
    }

    fn handle_frame(&mut self, now: Instant, predictor: &PositionPredictor) {
        for (device_id, runtime) in &mut self.devices {
            if runtime.animator.is_animating() {
                if let Some(position) = runtime.animator.tick(now) {
                    let mut render = self.render.write();
                    let state = render.entry(device_id.clone()).or_default();
                    state.position = Some(position);
                    // Shake plays for the duration of the move animation
                    if !runtime.animator.is_animating() {
                        state.should_shake = false;
                    }
                }
            } else if self.prediction.enabled {
                // Between real updates: dead-reckon the marker forward
                if let (Some(last_at), Some(_)) =
                    (runtime.last_confirmed_at, runtime.last_confirmed)
                {
                    let delta_ms = now.saturating_duration_since(last_at).as_millis() as u64;
                    if delta_ms > 0 && delta_ms <= self.prediction.horizon_ms {
                        if let Some(predicted) = predictor.predict_next(device_id, delta_ms) {
                            self.render
                                .write()
                                .entry(device_id.clone())
                                .or_default()
                                .position = Some(predicted);
                        }
                    }
                }
            }
        }
    }
}
