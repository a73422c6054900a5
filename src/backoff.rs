//! Reconnect and retry delays.

use std::time::Duration;

use rand::Rng;

/// Ceiling for the transient-status retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential reconnect backoff with full jitter on the upper half.
///
/// The nominal delay doubles from `base` up to `max`. The returned delay is
/// drawn uniformly from `[nominal / 2, nominal]` so that many clients
/// dropped by the same outage do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            jitter: true,
        }
    }

    /// Disable jitter, for deterministic tests.
    #[cfg(test)]
    fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = next.min(self.max);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let half = nominal / 2;
        let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Delay before resending a subscription the service answered with a
/// transient status: `attempt²` seconds, capped at one minute.
pub(crate) fn transient_retry_delay(attempt: u32) -> Duration {
    let secs = u64::from(attempt).saturating_mul(u64::from(attempt));
    Duration::from_secs(secs).min(MAX_RETRY_DELAY)
}
