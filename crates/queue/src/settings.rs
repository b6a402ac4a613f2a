use std::time::Duration;

pub const DEFAULT_QUEUE_CAP: usize = 512;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(64);
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_millis(1000);

/// Tunables for one event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Bounded channel capacity; producers wait when it is full.
    pub capacity: usize,
    /// Upper bound of the exponential part of the error backoff.
    pub max_backoff: Duration,
    /// Random extra delay added to every backoff, drawn from `[0, backoff_jitter)`.
    pub backoff_jitter: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAP,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl QueueSettings {
    /// Defaults overridden by `RECONQ_QUEUE_CAP`, `RECONQ_MAX_BACKOFF_SECS` and
    /// `RECONQ_BACKOFF_JITTER_MS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        let capacity = std::env::var("RECONQ_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(d.capacity);
        let max_backoff = std::env::var("RECONQ_MAX_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.max_backoff);
        let backoff_jitter = std::env::var("RECONQ_BACKOFF_JITTER_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.backoff_jitter);
        Self { capacity, max_backoff, backoff_jitter }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}
