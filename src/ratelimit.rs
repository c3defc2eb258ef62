//! Process-wide minimum spacing between generator calls.
//!
//! Vision APIs on free and low tiers throttle per key, not per task, so the
//! interval has to hold across every task running in the process. A single
//! [`RateGate`] is shared (by `Arc`) between all generators, and the
//! last-call clock lives behind an async mutex that is held while waiting.
//! Holding it makes concurrent callers queue up one interval apart instead
//! of all waking at the same instant.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// At most one pass per `interval`, system-wide.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// A gate that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until at least `interval` has passed since the previous pass,
    /// then record this one.
    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            if ready_at > Instant::now() {
                debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "rate limit: waiting"
                );
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
