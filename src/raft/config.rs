use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Lower bound of the randomized follower/candidate timeout, in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 800;
/// Upper bound of the randomized follower/candidate timeout, in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 1600;
/// Period of the leader heartbeat and candidate re-ask ticker, in milliseconds.
pub const TICKER_INTERVAL_MS: u64 = 200;
pub const BOOTSTRAP_RETRY: Duration = Duration::from_secs(5);
pub const REJOIN_RETRY_MS: u64 = 1000;
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Every time-related setting of a node, derived from its config only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub ticker_interval: Duration,
    pub bootstrap_retry: Duration,
    pub rejoin_retry: Duration,
    /// A follower that heard from a leader within this window refuses prevotes.
    pub leader_contact_window: Duration,
    pub leave_timeout: Duration,
    pub max_sub_quorum_cycles: u32,
}

fn scaled(ms: u64, performance: f64) -> Duration {
    Duration::from_nanos((ms as f64 * performance * 1_000_000.0).round() as u64)
}

impl Timing {
    pub fn from_config(config: &Config) -> Self {
        let min_timeout = scaled(MIN_TIMEOUT_MS, config.performance);
        Self {
            min_timeout,
            max_timeout: scaled(MAX_TIMEOUT_MS, config.performance),
            ticker_interval: scaled(TICKER_INTERVAL_MS, config.performance),
            bootstrap_retry: BOOTSTRAP_RETRY,
            rejoin_retry: scaled(REJOIN_RETRY_MS, config.performance),
            leader_contact_window: min_timeout,
            leave_timeout: LEAVE_TIMEOUT,
            max_sub_quorum_cycles: config.max_sub_quorum_cycles,
        }
    }

    pub fn random_timeout(&self) -> Duration {
        let min = self.min_timeout.as_millis() as u64;
        let max = (self.max_timeout.as_millis() as u64).max(min);
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(min..=max))
    }
}
