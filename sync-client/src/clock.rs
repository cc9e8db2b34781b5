//! Runtime clock.

use roomsync_core::{Clock, SystemClock};
use tokio::time::Instant;

/// Wall-clock time that advances with the Tokio timer.
///
/// Anchored to the system time at creation, then driven by
/// [`tokio::time::Instant`], so a paused test runtime moves it together
/// with every `sleep` in the dispatcher and the batch timers.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_ms: u64,
    start: Instant,
}

impl TokioClock {
    /// Create a clock reading the current system time.
    pub fn new() -> Self {
        Self {
            anchor_ms: SystemClock.now_ms(),
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.anchor_ms + self.start.elapsed().as_millis() as u64
    }
}
