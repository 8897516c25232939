//! Heartbeat Clock
//!
//! Wall-clock timestamps for heartbeat records, anchored to UTC once and
//! advanced by the runtime's monotonic clock afterwards. Peers can share a
//! clock, and paused runtime time (tests) moves it deterministically.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// UTC clock driven by the tokio monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// UTC time at the anchor instant
    anchor_utc: DateTime<Utc>,
    /// Monotonic anchor
    anchor: Instant,
}

impl Clock {
    /// Clock anchored at the current system time
    pub fn system() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Clock reading `utc` right now
    pub fn anchored_at(utc: DateTime<Utc>) -> Self {
        Self {
            anchor_utc: utc,
            anchor: Instant::now(),
        }
    }

    /// Current time
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed()).unwrap_or(chrono::Duration::zero());
        self.anchor_utc + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_runtime_time() {
        let start = Utc::now();
        let clock = Clock::anchored_at(start);
        assert_eq!(clock.now(), start);

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(2500));
    }
}
