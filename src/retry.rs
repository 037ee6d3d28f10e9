//! Exponential backoff with jitter for the quote polling loop.
//!
//! The monitor never gives up on transient errors, so there is no attempt
//! limit: the delay grows until it reaches `max_backoff` and stays there
//! until a successful poll resets it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// 0.2 = ±20%
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Millisecond-scale policy for tests
    pub fn fast() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry
    pub fn next_backoff(&mut self) -> Duration {
        let base_ms = self.base_backoff_ms();
        let jittered_ms = self.apply_jitter(base_ms);
        let max_ms = self.policy.max_backoff.as_millis() as u64;

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered_ms.min(max_ms))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_backoff_ms(&self) -> u64 {
        let initial_ms = self.policy.initial_backoff.as_millis() as f64;
        let max_ms = self.policy.max_backoff.as_millis() as f64;
        // powi saturates to inf for large exponents; min() clamps it
        let exponent = self.attempt.min(i32::MAX as u32) as i32;
        (initial_ms * self.policy.multiplier.powi(exponent)).min(max_ms) as u64
    }

    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if self.policy.jitter_factor <= 0.0 || backoff_ms == 0 {
            return backoff_ms;
        }
        let range = backoff_ms as f64 * self.policy.jitter_factor;
        let min = (backoff_ms as f64 - range).max(0.0);
        let max = backoff_ms as f64 + range;
        rand::thread_rng().gen_range(min..=max) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        });

        assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(2000));
        for _ in 0..20 {
            backoff.next_backoff();
        }
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_backoff().as_millis();
            assert!((400..=600).contains(&delay), "delay {} out of range", delay);
        }
    }
}
