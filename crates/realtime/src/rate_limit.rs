//! Fixed-window throttle for outbound requests
//!
//! Each limiter owns a single window. Independent limiters (generic API calls,
//! uploads) are separate instances and never share state.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: u32,
    /// Window length
    pub time_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            time_window: Duration::from_secs(1),
        }
    }
}

/// Rate limit check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the current window resets, set only when the call was refused
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Window {
    window_start: Instant,
    count: u32,
}

/// Fixed-window request throttle
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, time_window: Duration) -> Self {
        Self::with_config(RateLimitConfig {
            max_requests,
            time_window,
        })
    }

    /// A zero request budget is raised to one so `throttle` always makes progress
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config: RateLimitConfig {
                max_requests: config.max_requests.max(1),
                ..config
            },
            window: Mutex::new(Window {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Check and increment the window without waiting
    pub async fn try_acquire(&self) -> RateLimitDecision {
        let now = Instant::now();
        let mut window = self.window.lock().await;

        // Reset if in new window
        if now.duration_since(window.window_start) >= self.config.time_window {
            window.window_start = now;
            window.count = 0;
        }

        let allowed = window.count < self.config.max_requests;
        if allowed {
            window.count += 1;
        }

        let remaining = self.config.max_requests.saturating_sub(window.count);
        let retry_after = if allowed {
            None
        } else {
            let resets_at = window.window_start + self.config.time_window;
            Some(resets_at.saturating_duration_since(now))
        };

        RateLimitDecision {
            allowed,
            remaining,
            retry_after,
        }
    }

    /// Wait until the current window admits this caller
    ///
    /// Returns immediately while the window has capacity; otherwise sleeps
    /// until the window resets and tries again.
    pub async fn throttle(&self) {
        loop {
            let decision = self.try_acquire().await;
            let Some(wait) = decision.retry_after else {
                return;
            };

            tracing::debug!(
                wait_ms = wait.as_millis() as u64,
                max_requests = self.config.max_requests,
                "Rate limit reached - waiting for window reset"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_config(RateLimitConfig::default())
    }
}
