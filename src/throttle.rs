//! Update Throttler
//!
//! Gates how often downstream consumers act on a firehose of position
//! updates. No queueing: a rejected call is simply dropped by the caller.
//! `force_next()` resets the window so the next call is always accepted,
//! used when a device context changes and the stale pacing state must not
//! suppress the first fresh update.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for the update throttler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum interval between accepted updates (ms)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
    500
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Wall-clock gate: accepts at most one update per configured interval.
#[derive(Debug)]
pub struct UpdateThrottler {
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl UpdateThrottler {
    /// Create a throttler with the given minimum interval.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_accepted: None,
        }
    }

    /// Accept or reject an update at the current wall clock.
    pub fn should_update(&mut self) -> bool {
        self.should_update_at(Instant::now())
    }

    /// Accept or reject an update at an explicit instant.
    ///
    /// The coordinator reads the clock once per loop iteration and passes
    /// it in; tests drive this directly.
    pub fn should_update_at(&mut self, now: Instant) -> bool {
        match self.last_accepted {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_accepted = Some(now);
                true
            }
        }
    }

    /// Reset the window so the next call is accepted regardless of
    /// elapsed time.
    pub fn force_next(&mut self) {
        self.last_accepted = None;
    }

    /// The configured minimum interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
