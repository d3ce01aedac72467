//! Chat session errors

use crate::api_client::ApiClientError;
use crate::config::ConfigError;
use crate::hub::HubError;

/// Errors surfaced by [`crate::ChatSession`]
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("No signed-in user")]
    NotAuthenticated,

    #[error("Validation error: {0}")]
    Validation(String),

    /// The hub already reported a broken connection; nothing was sent
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Failed to upload attachment '{name}': {source}")]
    Upload {
        name: String,
        source: ApiClientError,
    },

    #[error("API error: {0}")]
    Api(#[from] ApiClientError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Chat session closed")]
    Closed,
}

impl ChatError {
    /// Rejected locally before any network activity
    pub fn is_client_error(&self) -> bool {
        matches!(self, ChatError::NotAuthenticated | ChatError::Validation(_))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
