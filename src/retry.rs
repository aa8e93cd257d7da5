use crate::config::{ChannelConfig, NetworkConfig};
use std::time::Duration;

/// Why an attempt is being retried; selects the backoff multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    Network,
    Timeout,
    Server,
}

/// Linear backoff for request retries: `min(attempt * base * multiplier, cap)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub network_multiplier: f64,
    pub server_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            network_multiplier: 2.0,
            server_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_delay,
            max_delay: config.retry_max_delay,
            ..Self::default()
        }
    }

    /// `retry` is 1-based: the first retry after the initial attempt is 1.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    pub fn delay_for(&self, retry: u32, cause: RetryCause) -> Duration {
        let multiplier = match cause {
            RetryCause::Network | RetryCause::Timeout => self.network_multiplier,
            RetryCause::Server => self.server_multiplier,
        };
        let millis = self.base_delay.as_millis() as f64 * f64::from(retry) * multiplier;
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }
}

/// Exponential backoff for the realtime channel: `min(base * 2^attempts, cap)`,
/// with a longer base when the previous connection was short-lived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub base_delay: Duration,
    pub short_lived_base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            short_lived_base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectBackoff {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            short_lived_base_delay: config.short_lived_base_delay,
            max_delay: config.max_delay,
        }
    }

    pub fn delay(&self, attempts: u32, short_lived: bool) -> Duration {
        let base = if short_lived {
            self.short_lived_base_delay
        } else {
            self.base_delay
        };
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
