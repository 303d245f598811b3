//! Position Animator
//!
//! Moves a rendered marker smoothly from its last confirmed position to a
//! newly received one over a fixed duration. The animation is a
//! cooperative task: the owner calls `tick(now)` once per rendering frame
//! and the animator reports interpolated positions through its callbacks.
//! There is no hidden timer and no frame API dependency, which makes the
//! whole thing steppable in tests with synthetic instants.
//!
//! Guarantees:
//! - at most one animation in flight per animator; starting a new one
//!   cancels the previous without firing its completion callback
//! - endpoints equal within ~1e-6 degrees complete immediately and
//!   synchronously (one `on_complete`, zero `on_update`)
//! - `cancel()` is idempotent and drops pending callbacks

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::geo::GeoPoint;

/// Coordinate tolerance under which an animation is a no-op (degrees).
pub const COORDINATE_TOLERANCE: f64 = 1e-6;

/// Easing function applied to raw progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    /// Constant velocity
    #[default]
    Linear,
    /// Fast start, decelerating finish
    EaseOutQuad,
    /// Slow start and finish, fast middle
    EaseInOutCubic,
}

impl Easing {
    /// Map raw progress `t ∈ [0, 1]` to eased progress.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::EaseOutQuad => t * (2.0 - t),
            Self::EaseInOutCubic => {
                if t < 0.5 {
                    4.0 * t * t * t
                } else {
                    let u = -2.0 * t + 2.0;
                    1.0 - u * u * u / 2.0
                }
            }
        }
    }
}

/// Configuration for marker animation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Animation duration (ms)
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Easing function
    #[serde(default)]
    pub easing: Easing,
    /// Frame stepping interval for the coordinator's tick loop (ms)
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

fn default_duration_ms() -> u64 {
    900
}

fn default_frame_interval_ms() -> u64 {
    16
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            easing: Easing::default(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

/// Per-frame update callback: interpolated position + raw progress.
pub type UpdateFn = Box<dyn FnMut(GeoPoint, f64) + Send>;
/// Completion callback. Never fired for cancelled/replaced animations.
pub type CompleteFn = Box<dyn FnOnce() + Send>;

/// Options for one animation run.
#[derive(Default)]
pub struct AnimationOptions {
    /// Duration override; animator default when `None`
    pub duration: Option<Duration>,
    /// Easing override; animator default when `None`
    pub easing: Option<Easing>,
    /// Fired once per tick with the interpolated position
    pub on_update: Option<UpdateFn>,
    /// Fired exactly once when the animation runs to completion
    pub on_complete: Option<CompleteFn>,
}

impl AnimationOptions {
    /// Empty options (animator defaults, no callbacks).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the duration.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the easing function.
    pub fn easing(mut self, easing: Easing) -> Self {
        self.easing = Some(easing);
        self
    }

    /// Set the per-frame update callback.
    pub fn on_update(mut self, f: impl FnMut(GeoPoint, f64) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    /// Set the completion callback.
    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

/// One in-flight animation.
struct AnimationTask {
    from: GeoPoint,
    to: GeoPoint,
    start: Instant,
    duration: Duration,
    easing: Easing,
    on_update: Option<UpdateFn>,
    on_complete: Option<CompleteFn>,
}

/// Animates one target. At most one task is active at a time.
pub struct PositionAnimator {
    task: Option<AnimationTask>,
    default_duration: Duration,
    default_easing: Easing,
    current: Option<GeoPoint>,
}

impl PositionAnimator {
    /// Create an animator with the given defaults.
    pub fn new(config: &AnimationConfig) -> Self {
        Self {
            task: None,
            default_duration: Duration::from_millis(config.duration_ms),
            default_easing: config.easing,
            current: None,
        }
    }

    /// Start animating from `from` to `to`, cancelling any in-flight
    /// animation (its completion callback is dropped, not fired).
    pub fn animate(&mut self, from: GeoPoint, to: GeoPoint, options: AnimationOptions) {
        self.animate_at(from, to, options, Instant::now());
    }

    /// Start an animation with an explicit start instant.
    pub fn animate_at(
        &mut self,
        from: GeoPoint,
        to: GeoPoint,
        options: AnimationOptions,
        now: Instant,
    ) {
        // Replacing the task drops the previous callbacks unfired
        self.task = None;

        if from.approx_eq(&to, COORDINATE_TOLERANCE) {
            // Nothing to interpolate: complete synchronously, no frames
            self.current = Some(to);
            if let Some(on_complete) = options.on_complete {
                on_complete();
            }
            return;
        }

        trace!(%from, %to, "animation started");
        self.current = Some(from);
        self.task = Some(AnimationTask {
            from,
            to,
            start: now,
            duration: options.duration.unwrap_or(self.default_duration),
            easing: options.easing.unwrap_or(self.default_easing),
            on_update: options.on_update,
            on_complete: options.on_complete,
        });
    }

    /// Advance the animation to `now`. Fires `on_update` once, and
    /// `on_complete` if the duration has elapsed. Returns the current
    /// interpolated position while a task is active.
    pub fn tick(&mut self, now: Instant) -> Option<GeoPoint> {
        let task = self.task.as_mut()?;

        let elapsed = now.saturating_duration_since(task.start);
        let raw = if task.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / task.duration.as_secs_f64()).min(1.0)
        };
        let eased = task.easing.apply(raw);

        let position = GeoPoint::new(
            task.from.latitude + (task.to.latitude - task.from.latitude) * eased,
            task.from.longitude + (task.to.longitude - task.from.longitude) * eased,
        );
        self.current = Some(position);

        if let Some(on_update) = task.on_update.as_mut() {
            on_update(position, raw);
        }

        if raw >= 1.0 {
            if let Some(finished) = self.task.take() {
                if let Some(on_complete) = finished.on_complete {
                    on_complete();
                }
            }
        }

        Some(position)
    }

    /// Stop the frame loop and drop pending callbacks. Idempotent.
    pub fn cancel(&mut self) {
        self.task = None;
    }

    /// Whether an animation is in flight.
    pub fn is_animating(&self) -> bool {
        self.task.is_some()
    }

    /// Most recent interpolated position (or endpoint after completion).
    pub fn current_position(&self) -> Option<GeoPoint> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn animator() -> PositionAnimator {
        PositionAnimator::new(&AnimationConfig::default())
    }

    #[test]
    fn test_easing_endpoints() {
        for easing in [Easing::Linear, Easing::EaseOutQuad, Easing::EaseInOutCubic] {
            assert_eq!(easing.apply(0.0), 0.0, "{:?}", easing);
            assert_eq!(easing.apply(1.0), 1.0, "{:?}", easing);
        }
        assert_eq!(Easing::Linear.apply(0.5), 0.5);
        assert_eq!(Easing::EaseOutQuad.apply(0.5), 0.75);
        assert_eq!(Easing::EaseInOutCubic.apply(0.5), 0.5);
    }

    #[test]
    fn test_equal_endpoints_complete_immediately() {
        let mut anim = animator();
        let completions = Arc::new(AtomicU32::new(0));
        let updates = Arc::new(AtomicU32::new(0));

        let p = GeoPoint::new(48.0, 11.0);
        let c = completions.clone();
        let u = updates.clone();
        anim.animate(
            p,
            GeoPoint::new(48.0 + 1e-8, 11.0),
            AnimationOptions::new()
                .on_update(move |_, _| {
                    u.fetch_add(1, Ordering::SeqCst);
                })
                .on_complete(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert!(!anim.is_animating());
        assert_eq!(completions.load(Ordering::SeqCst), 1, "one on_complete");
        assert_eq!(updates.load(Ordering::SeqCst), 0, "no on_update");
    }

    #[test]
    fn test_interpolation_from_start_to_end() {
        let mut anim = animator();
        let from = GeoPoint::new(0.0, 0.0);
        let to = GeoPoint::new(1.0, 2.0);
        let seen: Arc<Mutex<Vec<(GeoPoint, f64)>>> = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        let sink = seen.clone();
        anim.animate_at(
            from,
            to,
            AnimationOptions::new()
                .duration(Duration::from_millis(1000))
                .on_update(move |p, raw| sink.lock().unwrap().push((p, raw))),
            start,
        );

        anim.tick(start);
        anim.tick(start + Duration::from_millis(500));
        anim.tick(start + Duration::from_millis(1000));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);

        let (first, raw0) = seen[0];
        assert_eq!(raw0, 0.0);
        assert!(first.approx_eq(&from, 1e-9), "first update at from");

        let (mid, raw1) = seen[1];
        assert_eq!(raw1, 0.5);
        assert!(mid.approx_eq(&GeoPoint::new(0.5, 1.0), 1e-9));

        let (last, raw2) = seen[2];
        assert_eq!(raw2, 1.0);
        assert!(last.approx_eq(&to, 1e-9), "final update at to");
        assert!(!anim.is_animating());
    }

    #[test]
    fn test_replacement_cancels_without_completion() {
        let mut anim = animator();
        let first_completed = Arc::new(AtomicU32::new(0));
        let second_completed = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        let c1 = first_completed.clone();
        anim.animate_at(
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            AnimationOptions::new()
                .duration(Duration::from_millis(1000))
                .on_complete(move || {
                    c1.fetch_add(1, Ordering::SeqCst);
                }),
            start,
        );
        anim.tick(start + Duration::from_millis(300));

        // Second animation starts before the first finishes
        let c2 = second_completed.clone();
        anim.animate_at(
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(2.0, 2.0),
            AnimationOptions::new()
                .duration(Duration::from_millis(500))
                .on_complete(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                }),
            start + Duration::from_millis(300),
        );
        anim.tick(start + Duration::from_millis(900));

        assert_eq!(
            first_completed.load(Ordering::SeqCst),
            0,
            "replaced animation must never complete"
        );
        assert_eq!(second_completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut anim = animator();
        let completed = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        let c = completed.clone();
        anim.animate_at(
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            AnimationOptions::new().on_complete(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            start,
        );

        anim.cancel();
        anim.cancel();

        assert!(!anim.is_animating());
        assert_eq!(anim.tick(start + Duration::from_secs(5)), None);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_progress_clamps_past_duration() {
        let mut anim = animator();
        let start = Instant::now();
        let to = GeoPoint::new(1.0, 1.0);
        anim.animate_at(
            GeoPoint::new(0.0, 0.0),
            to,
            AnimationOptions::new().duration(Duration::from_millis(100)),
            start,
        );

        // Tick long after the duration elapsed: lands exactly on `to`
        let landed = anim.tick(start + Duration::from_secs(10)).unwrap();
        assert!(landed.approx_eq(&to, 1e-12));
        assert_eq!(anim.current_position(), Some(landed));
    }
}
