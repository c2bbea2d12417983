//! Sync tunables.

use std::time::Duration;

/// How often a polling channel ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Budget for one tick (pull + push) before it counts as failed.
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive tick failures before the remote is marked errored and
/// polling stops.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Most operations carried by one query or mutation.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

/// Exponent cap so the backoff multiplier cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub tick_timeout: Duration,
    pub max_failures: u32,
    pub batch_limit: usize,
}

impl SyncConfig {
    /// Extra delay before the next tick after `failures` consecutive
    /// failures: `poll_interval * 2^failures`, capped.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        self.poll_interval * 2_u32.saturating_pow(failures.min(MAX_BACKOFF_EXPONENT))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            tick_timeout: DEFAULT_TICK_TIMEOUT,
            max_failures: DEFAULT_MAX_FAILURES,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SyncConfig {
            poll_interval: Duration::from_millis(100),
            ..SyncConfig::default()
        };

        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));

        // Huge failure counts must not overflow the multiplier.
        assert_eq!(config.backoff(1_000), config.backoff(MAX_BACKOFF_EXPONENT));
    }
}
