use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::status;

/// Delay between reconnection attempts. `base == max` with no jitter gives
/// a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let capped = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.max.max(self.base));
        if self.jitter.is_zero() {
            return capped;
        }
        let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Sleeps for `delay`, printing the seconds left once per second. Returns
/// false as soon as `shutdown` fires.
pub async fn backoff(delay: Duration, shutdown: &CancellationToken) -> bool {
    let mut remaining = delay;
    while !remaining.is_zero() {
        let step = remaining.min(Duration::from_secs(1));
        status::countdown(remaining.as_secs_f64().ceil() as u64);
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(step) => {}
        }
        remaining -= step;
    }
    !shutdown.is_cancelled()
}
