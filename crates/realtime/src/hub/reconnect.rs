//! Automatic reconnection backoff

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Default number of reconnect attempts before giving up
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 4;

/// Delay before the second attempt; doubles after that
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any single delay
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How the hub connection retries after an unexpected close
///
/// The first attempt runs immediately. Later attempts wait `base_delay`,
/// `2 * base_delay`, `4 * base_delay`, ... capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay to spread reconnect storms
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never retries; an unexpected close goes straight to `Failed`
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delays between attempts, suitable for `tokio_retry::Retry`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff yields base^n * factor; base 2 with factor
        // base_delay / 2 gives base_delay, 2 * base_delay, ...
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        let use_jitter = self.jitter;

        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1) as usize)
            .map(move |delay| if use_jitter { jitter(delay) } else { delay })
    }
}
