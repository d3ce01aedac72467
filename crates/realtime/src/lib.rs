//! Support desk real-time messaging runtime
//!
//! Client-side plumbing behind the portal's live chat:
//! - `hub`: persistent hub connection with lazy connect, reconnection and
//!   typed event subscriptions
//! - `batching`: ordered, batched delivery of inbound messages
//! - `rate_limit` / `cache`: throttling and caching of HTTP traffic
//! - `cleanup`: deterministic teardown of everything a surface acquired
//! - `chat`: the session that ties these together for one chat view

pub mod api_client;
pub mod batching;
pub mod cache;
pub mod chat;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod hub;
pub mod rate_limit;

pub use api_client::{
    ApiClient, ApiClientConfig, ApiClientError, AssistantClient, AttachmentUploader, FileUpload,
    HistorySource, IdentityStore, StaticIdentity,
};
pub use batching::{BatchConfig, MessageBatcher, MessageOrder};
pub use cache::{cache_key, CacheStats, ResponseCache};
pub use chat::{ChatServices, ChatSession};
pub use cleanup::CleanupRegistry;
pub use config::{ConfigError, RealtimeConfig};
pub use error::{ChatError, ChatResult};
pub use hub::{
    ConnectionState, HubConnection, HubError, HubEvent, HubEventName, HubResult, ReceiveMessage,
    ReconnectPolicy, Subscription,
};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
