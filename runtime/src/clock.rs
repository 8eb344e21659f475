//! Runtime clock.

use squad_engine::{Clock, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Wall-clock milliseconds that never go backwards.
///
/// The wall time is read once at construction; afterwards the clock advances
/// with [`tokio::time::Instant`], so it follows paused time in tests and is
/// immune to system clock adjustments.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor_ms: Timestamp,
    anchor: Instant,
    last: AtomicU64,
}

impl MonotonicClock {
    /// Anchor on the current wall-clock time.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis().max(0) as Timestamp;
        Self::starting_at(now)
    }

    /// Anchor on an explicit timestamp.
    pub fn starting_at(anchor_ms: Timestamp) -> Self {
        Self {
            anchor_ms,
            anchor: Instant::now(),
            last: AtomicU64::new(anchor_ms),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let now = self.anchor_ms + self.anchor.elapsed().as_millis() as Timestamp;
        let previous = self.last.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}
