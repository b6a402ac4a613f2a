//! Error backoff: `min(2^retry, max) seconds + jitter`.

use std::time::Duration;

use rand::Rng;

use crate::settings::QueueSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(max: Duration, jitter: Duration) -> Self { Self { max, jitter } }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(settings.max_backoff, settings.backoff_jitter)
    }

    /// Exponential part only. `retry` counts from 1 for the first failure.
    pub fn base(&self, retry: u32) -> Duration {
        let secs = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max)
    }

    /// Base delay plus a uniformly drawn jitter in `[0, jitter)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..jitter_ms) };
        self.base(retry) + Duration::from_millis(extra)
    }
}

impl Default for Backoff {
    fn default() -> Self { Self::from_settings(&QueueSettings::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::default();
        let secs: Vec<u64> = (1..=7).map(|n| b.base(n).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 64, 64]);
    }

    #[test]
    fn huge_retry_counts_stay_capped() {
        let b = Backoff::default();
        assert_eq!(b.base(63), Duration::from_secs(64));
        assert_eq!(b.base(64), Duration::from_secs(64));
        assert_eq!(b.base(u32::MAX), Duration::from_secs(64));
    }

    #[test]
    fn jitter_stays_below_one_second() {
        let b = Backoff::default();
        for retry in 1..=10 {
            for _ in 0..50 {
                let d = b.delay(retry);
                let base = b.base(retry);
                assert!(d >= base);
                assert!(d < base + Duration::from_secs(1));
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let b = Backoff::new(Duration::from_secs(10), Duration::ZERO);
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(9), Duration::from_secs(10));
    }
}
