//! Call timing configuration loaded from environment variables.

use std::time::Duration;

use murmur_media::IceConfig;
use murmur_shared::constants::{RING_TIMEOUT_SECS, STATS_INTERVAL_MS, TEARDOWN_DELAY_MS};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a caller waits for an answer.
    /// Env: `MURMUR_RING_TIMEOUT_SECS`
    /// Default: 30 s
    pub ring_timeout: Duration,

    /// Delay between the end of a call and deletion of its record and
    /// candidate list, so the other side can still observe the outcome.
    /// Env: `MURMUR_TEARDOWN_DELAY_MS`
    /// Default: 3000 ms
    pub teardown_delay: Duration,

    /// Env: `MURMUR_STATS_INTERVAL_MS`
    /// Default: 1000 ms
    pub stats_interval: Duration,

    pub ice: IceConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(RING_TIMEOUT_SECS),
            teardown_delay: Duration::from_millis(TEARDOWN_DELAY_MS),
            stats_interval: Duration::from_millis(STATS_INTERVAL_MS),
            ice: IceConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            ice: IceConfig::from_lookup(&lookup),
            ..Self::default()
        };

        if let Some(secs) = parse_positive(&lookup, "MURMUR_RING_TIMEOUT_SECS") {
            config.ring_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_positive(&lookup, "MURMUR_TEARDOWN_DELAY_MS") {
            config.teardown_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive(&lookup, "MURMUR_STATS_INTERVAL_MS") {
            config.stats_interval = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid duration, using default");
            None
        }
    }
}
