//! Wall-clock timestamps derived from a monotonic timebase
//!
//! Every timestamp a peer writes (`registeredAt`, `lastSeen`, `createdAt`)
//! comes from one anchored clock, so a peer's own `lastSeen` never moves
//! backwards even if the system clock is adjusted. The timebase is tokio's,
//! which lets paused-time tests advance it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Clock {
    anchor: Arc<(DateTime<Utc>, Instant)>,
}

impl Clock {
    /// Anchor the clock at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor the clock at a chosen wall time.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor: Arc::new((wall, Instant::now())),
        }
    }

    #[inline]
    pub fn now(&self) -> DateTime<Utc> {
        let (wall, start) = *self.anchor;
        let elapsed = Instant::now().saturating_duration_since(start);
        wall + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// `now` as unix milliseconds, the stored timestamp representation.
    pub fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
