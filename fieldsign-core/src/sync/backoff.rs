//! Exponential backoff with jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use uuid::Uuid;

/// `delay = min(base * 2^attempt, cap) + jitter`, with jitter drawn from
/// `0..=max_jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15 * 60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_count`.
    ///
    /// Pure in its inputs: the same seed always yields the same jitter, so a
    /// record's delays never shrink as its attempt count grows.
    pub fn delay(&self, attempt_count: u32, seed: u64) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;

        let factor = 1u64.checked_shl(attempt_count.min(63)).unwrap_or(u64::MAX);
        let exp_ms = base_ms.saturating_mul(factor).min(cap_ms);

        Duration::from_millis(exp_ms) + self.jitter(seed)
    }

    /// Per-record delay, seeded from its id.
    pub fn delay_for(&self, local_id: &Uuid, attempt_count: u32) -> Duration {
        self.delay(attempt_count, local_id.as_u128() as u64)
    }

    /// Largest delay the policy can produce.
    pub fn max_delay(&self) -> Duration {
        self.cap + self.max_jitter
    }

    fn jitter(&self, seed: u64) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}
