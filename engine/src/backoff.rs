//! Exponential backoff with jitter between failed sends.

use std::time::Duration;

/// Backoff policy.
///
/// The delay after the `n`th consecutive failure is `base * 2^(n-1)`,
/// capped at `max`. Half of it is fixed and the other half random, so
/// devices that failed together do not retry together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a policy. `max` is raised to `base` if smaller.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt, without jitter.
    pub fn ceiling(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before the next attempt, with jitter.
    pub fn delay(&self, failures: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(failures).as_millis()).unwrap_or(u64::MAX);
        let fixed = ceiling_ms / 2;
        let spread = ceiling_ms - fixed;
        let jitter_ms = if spread == 0 {
            0
        } else {
            rand::random::<u64>() % (spread + 1)
        };
        Duration::from_millis(fixed + jitter_ms)
    }
}
