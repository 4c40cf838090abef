use std::time::Duration;

/// Exponential retry delay: `min(initial_delay * 2^(attempt-1), max_delay)`.
///
/// `jitter` is zero by default so delays are reproducible. A non-zero
/// value adds a uniformly random `0..=jitter` on top of the capped delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next retry, given the number of attempts already made.
    ///
    /// `attempt` is 1-indexed; 0 is treated as 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// [`next_delay`](Self::next_delay) plus random jitter, if configured.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.next_delay(attempt) + jitter_delay(self.jitter)
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
