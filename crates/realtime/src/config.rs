//! Runtime configuration

use std::env;
use std::time::Duration;

use supportdesk_shared::UserId;
use url::Url;

use crate::batching::{BatchConfig, MessageOrder};
use crate::hub::ReconnectPolicy;
use crate::rate_limit::RateLimitConfig;

/// Real-time runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    // API
    pub api_url: Url,
    pub hub_path: String,
    pub api_token: Option<String>,
    pub user_id: Option<UserId>,
    pub request_timeout: Duration,

    // Batching
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub message_order: MessageOrder,

    // Throttling
    pub api_rate_limit: RateLimitConfig,
    pub upload_rate_limit: RateLimitConfig,

    // Response cache
    pub cache_max_age: Duration,
    pub cache_max_size: usize,

    // Hub reconnection
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn millis_or(key: &str, default: u64) -> Duration {
    Duration::from_millis(parse_or(key, default))
}

/// A limiter that admits nothing would stall every request
fn rate_limit_from_env(
    requests_key: &'static str,
    window_key: &str,
    default_requests: u32,
) -> Result<RateLimitConfig, ConfigError> {
    let max_requests = parse_or(requests_key, default_requests);
    if max_requests == 0 {
        return Err(ConfigError::Invalid(requests_key));
    }
    Ok(RateLimitConfig {
        max_requests,
        time_window: millis_or(window_key, 1000),
    })
}

impl RealtimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("SUPPORTDESK_API_URL")
            .map_err(|_| ConfigError::Missing("SUPPORTDESK_API_URL"))?;
        let api_url = Url::parse(&api_url)
            .map_err(|e| ConfigError::InvalidUrl("SUPPORTDESK_API_URL", e.to_string()))?;

        let message_order = match env::var("CHAT_MESSAGE_ORDER").ok().as_deref() {
            None | Some("newest_first") => MessageOrder::NewestFirst,
            Some("oldest_first") => MessageOrder::OldestFirst,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "CHAT_MESSAGE_ORDER must be newest_first or oldest_first",
                ))
            }
        };

        Ok(Self {
            api_url,
            hub_path: env::var("SUPPORTDESK_HUB_PATH").unwrap_or_else(|_| "/chatHub".to_string()),
            api_token: env::var("SUPPORTDESK_API_TOKEN").ok().filter(|t| !t.is_empty()),
            user_id: env::var("SUPPORTDESK_USER_ID")
                .ok()
                .filter(|id| !id.is_empty())
                .map(UserId::new),
            request_timeout: millis_or("HTTP_REQUEST_TIMEOUT_MS", 30_000),

            batch_size: parse_or("CHAT_BATCH_SIZE", 50usize).max(1),
            batch_interval: millis_or("CHAT_BATCH_INTERVAL_MS", 100),
            message_order,

            api_rate_limit: rate_limit_from_env(
                "API_RATE_LIMIT_MAX_REQUESTS",
                "API_RATE_LIMIT_WINDOW_MS",
                10,
            )?,
            upload_rate_limit: rate_limit_from_env(
                "UPLOAD_RATE_LIMIT_MAX_REQUESTS",
                "UPLOAD_RATE_LIMIT_WINDOW_MS",
                3,
            )?,

            cache_max_age: Duration::from_secs(parse_or("API_CACHE_MAX_AGE_SECS", 300)),
            cache_max_size: parse_or("API_CACHE_MAX_SIZE", 100),

            reconnect_max_attempts: parse_or("HUB_RECONNECT_MAX_ATTEMPTS", 4),
            reconnect_base_delay: millis_or("HUB_RECONNECT_BASE_DELAY_MS", 1000),
            reconnect_max_delay: millis_or("HUB_RECONNECT_MAX_DELAY_MS", 30_000),
        })
    }

    /// Absolute hub URL below the API URL
    pub fn hub_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.api_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ConfigError::InvalidUrl("SUPPORTDESK_API_URL", "cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.extend(self.hub_path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            batch_interval: self.batch_interval,
            order: self.message_order,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            jitter: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid URL in {0}: {1}")]
    InvalidUrl(&'static str, String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
