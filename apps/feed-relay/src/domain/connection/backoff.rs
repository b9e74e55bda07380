//! Backoff Policy
//!
//! Maps a reconnection attempt number to a delay using exponential backoff
//! with a ceiling and additive jitter:
//!
//! ```text
//! delay  = min(max_delay, base_delay * 2^attempt)
//! result = delay + uniform(0, jitter_factor * delay)
//! ```
//!
//! The policy is stateless; callers own the attempt counter
//! (see [`ReconnectState`](super::ReconnectState)).

use std::time::Duration;

use rand::Rng;

/// Default jitter fraction added on top of the computed delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff with ceiling and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt zero.
    pub base_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Upper bound of the additive jitter as a fraction of the delay.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::upstream()
    }
}

impl BackoffPolicy {
    /// Create a policy with the default jitter.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Policy for the relay's upstream link (1s → 10s).
    #[must_use]
    pub const fn upstream() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Policy for consumers reconnecting to the relay (1s → 30s).
    #[must_use]
    pub const fn client() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Same policy without jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before attempt `attempt` (zero-based), jitter included.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter_fraction: f64 = rand::rng().random_range(0.0..=self.jitter_factor);
        delay + delay.mul_f64(jitter_fraction)
    }

    /// Delay before attempt `attempt` without jitter.
    #[must_use]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        // 2^31 already exceeds any sane ceiling; clamp so the shift cannot overflow.
        let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
