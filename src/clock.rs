use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic + wall clock handle.
///
/// Every timeout in the control plane is measured against this clock. The
/// monotonic side is tokio time, so tests running under a paused runtime
/// drive all components through virtual time.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Arc<Clock> {
        Arc::new(Clock { origin: Instant::now() })
    }

    /// Milliseconds since the clock was created. Monotonic, never wall time.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Wall-clock timestamp for persisted records and logs.
    pub fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Elapsed millis since `earlier_ms`, saturating at zero.
    pub fn since_ms(&self, earlier_ms: u64) -> u64 {
        self.now_ms().saturating_sub(earlier_ms)
    }

    /// Deadline helper: monotonic millis at `duration` from now.
    pub fn deadline_ms(&self, duration: Duration) -> u64 {
        self.now_ms() + duration.as_millis() as u64
    }
}
