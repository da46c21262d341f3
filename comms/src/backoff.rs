//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use rand::Rng;

/// Strategy for spacing reconnection attempts.
pub trait Backoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration;
}

#[derive(Debug, Clone)]
pub struct ConstantBackoff(Duration);

impl ConstantBackoff {
    pub fn new(timeout: Duration) -> Self {
        Self(timeout)
    }
}

impl Backoff for ConstantBackoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        self.0
    }
}

/// Exponential backoff with full jitter: the delay for attempt `n` is drawn
/// uniformly from `[0, min(initial * 2^(n-1), max)]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    fn ceiling(&self, attempts: usize) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (attempts - 1).min(31) as u32;
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff for ExponentialBackoff {
    fn calculate_backoff(&self, attempts: usize) -> Duration {
        let ceiling = self.ceiling(attempts);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant() {
        let backoff = ConstantBackoff::new(Duration::from_secs(2));
        assert_eq!(backoff.calculate_backoff(0), Duration::ZERO);
        assert_eq!(backoff.calculate_backoff(1), Duration::from_secs(2));
        assert_eq!(backoff.calculate_backoff(10), Duration::from_secs(2));
    }

    #[test]
    fn exponential_ceiling_doubles_to_cap() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.ceiling(0), Duration::ZERO);
        assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(5), Duration::from_secs(16));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(100), Duration::from_secs(30));
    }

    #[test]
    fn full_jitter_stays_within_ceiling() {
        let backoff = ExponentialBackoff::default();
        for attempts in 1..=8 {
            for _ in 0..32 {
                let delay = backoff.calculate_backoff(attempts);
                assert!(delay <= backoff.ceiling(attempts));
            }
        }
    }
}
