//! HTTP collaborators of a chat session
//!
//! History paging, attachment upload and the AI assistant all go through one
//! [`ApiClient`]. Generic calls share the API rate limiter; uploads have their
//! own. Older history pages never change, so they are served from the
//! response cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use supportdesk_shared::{
    AssistantRequest, AssistantResponse, Attachment, Message, UserId, WireMessage,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use url::Url;

use crate::cache::{cache_key, CacheStats, ResponseCache};
use crate::config::RealtimeConfig;
use crate::rate_limit::{RateLimitConfig, RateLimiter};

/// Maximum number of retry attempts for transient read failures
const MAX_RETRIES: usize = 3;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (5 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Error type for HTTP collaborator calls
#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiClientError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            ApiClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ApiClientError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiClientError::Json(_) | ApiClientError::InvalidUrl(_) => false,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiClientError>;

/// A file picked by the user, not yet uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            data,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Source of stored chat history
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Messages for `user`
    ///
    /// With `before` set, returns at most `limit` messages older than that
    /// instant; without it, returns the full stored history.
    async fn fetch_history(
        &self,
        user: &UserId,
        before: Option<OffsetDateTime>,
        limit: usize,
    ) -> ApiResult<Vec<Message>>;
}

/// Persists attachments before the message referencing them is sent
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, file: &FileUpload) -> ApiResult<Attachment>;
}

/// AI assistant endpoint
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn ask(&self, request: &AssistantRequest) -> ApiResult<AssistantResponse>;
}

/// Read-only view of the signed-in user
pub trait IdentityStore: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;
}

/// Identity fixed at construction
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(Option<UserId>);

impl StaticIdentity {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self(user_id)
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self(Some(UserId::new(user_id)))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityStore for StaticIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.0.clone()
    }
}

/// Settings for [`ApiClient`]
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: Url,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub api_rate_limit: RateLimitConfig,
    pub upload_rate_limit: RateLimitConfig,
    pub cache_max_age: Duration,
    pub cache_max_size: usize,
}

impl ApiClientConfig {
    pub fn from_realtime(config: &RealtimeConfig) -> Self {
        Self {
            base_url: config.api_url.clone(),
            api_token: config.api_token.clone(),
            request_timeout: config.request_timeout,
            api_rate_limit: config.api_rate_limit,
            upload_rate_limit: config.upload_rate_limit,
            cache_max_age: config.cache_max_age,
            cache_max_size: config.cache_max_size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    name: Option<String>,
    url: String,
}

/// HTTP client for the support desk API
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    api_token: Option<String>,
    api_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache<Value>>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> ApiResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url,
            api_token: config.api_token,
            api_limiter: Arc::new(RateLimiter::with_config(config.api_rate_limit)),
            upload_limiter: Arc::new(RateLimiter::with_config(config.upload_rate_limit)),
            cache: Arc::new(ResponseCache::new(
                config.cache_max_age,
                config.cache_max_size,
            )),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of an API path below the base URL
    pub fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// History URL; the paging query is only added for older pages
    pub fn history_url(
        &self,
        user: &UserId,
        before: Option<OffsetDateTime>,
        limit: usize,
    ) -> ApiResult<Url> {
        let mut url = self.endpoint(&["chat", user.as_str()])?;
        if let Some(before) = before {
            let before = before
                .format(&Rfc3339)
                .map_err(|e| ApiClientError::InvalidUrl(e.to_string()))?;
            url.query_pairs_mut()
                .append_pair("before", &before)
                .append_pair("limit", &limit.to_string());
        }
        Ok(url)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop expired cache entries
    pub fn sweep_cache(&self) {
        self.cache.cleanup();
    }

    /// Forget cached history pages for one user
    pub fn invalidate_history(&self, user: &UserId) {
        if let Ok(url) = self.endpoint(&["chat", user.as_str()]) {
            // Only paged requests are cached, and they all carry a query
            self.cache.delete_prefix(&format!("GET:{}?", url));
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn send_get(&self, url: &Url) -> ApiResult<Value> {
        self.api_limiter.throttle().await;
        let response = self.authorized(self.http.get(url.clone())).send().await?;
        Self::read_json(response).await
    }

    /// GET with retries for transient failures, optionally served from cache
    async fn get_json(&self, url: &Url, cacheable: bool) -> ApiResult<Value> {
        let key = cache_key("GET", url.as_str(), None);
        if cacheable {
            if let Some(value) = self.cache.get(&key) {
                tracing::debug!(url = %url, "Response cache hit");
                return Ok(value);
            }
        }

        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(RETRY_BASE_DELAY.as_millis() as u64 / 2)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        let value = RetryIf::spawn(
            retry_strategy,
            move || async move {
                let result = self.send_get(url).await;
                if let Err(e) = &result {
                    if e.is_transient() {
                        tracing::debug!(url = %url, error = %e, "Transient error - will retry");
                    }
                }
                result
            },
            |e: &ApiClientError| e.is_transient(),
        )
        .await?;

        if cacheable {
            self.cache.set(&key, value.clone());
        }
        Ok(value)
    }
}

#[async_trait]
impl HistorySource for ApiClient {
    async fn fetch_history(
        &self,
        user: &UserId,
        before: Option<OffsetDateTime>,
        limit: usize,
    ) -> ApiResult<Vec<Message>> {
        let url = self.history_url(user, before, limit)?;

        // The newest page changes as messages arrive; older pages do not
        let value = self.get_json(&url, before.is_some()).await?;
        let rows: Vec<WireMessage> = serde_json::from_value(value)?;

        tracing::debug!(
            user_id = %user,
            count = rows.len(),
            paged = before.is_some(),
            "Fetched chat history"
        );
        Ok(rows.into_iter().map(Message::from).collect())
    }
}

#[async_trait]
impl AttachmentUploader for ApiClient {
    async fn upload(&self, file: &FileUpload) -> ApiResult<Attachment> {
        let url = self.endpoint(&["chathub", "sendattachments"])?;

        let mut part = multipart::Part::bytes(file.data.clone()).file_name(file.name.clone());
        if let Some(content_type) = &file.content_type {
            part = part.mime_str(content_type)?;
        }
        let form = multipart::Form::new().part("file", part);

        self.upload_limiter.throttle().await;
        let response = self
            .authorized(self.http.post(url))
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = Self::read_json(response).await?;

        tracing::debug!(name = %file.name, size = file.data.len(), "Attachment uploaded");
        Ok(Attachment {
            name: uploaded.name.unwrap_or_else(|| file.name.clone()),
            url: uploaded.url,
        })
    }
}

#[async_trait]
impl AssistantClient for ApiClient {
    async fn ask(&self, request: &AssistantRequest) -> ApiResult<AssistantResponse> {
        let url = self.endpoint(&["ai", "ask"])?;

        self.api_limiter.throttle().await;
        let response = self
            .authorized(self.http.post(url))
            .json(request)
            .send()
            .await?;
        Self::read_json(response).await
    }
}
