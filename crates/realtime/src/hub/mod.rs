//! Hub connection manager
//!
//! Owns one persistent duplex connection to the messaging hub and multiplexes
//! typed event subscriptions over it:
//! - Lazy connect on first invocation
//! - Automatic reconnection with backoff
//! - One underlying listener per event name, fanned out to every handler

pub mod connection;
pub mod listeners;
pub mod protocol;
pub mod reconnect;
pub mod state;
pub mod transport;

use serde::de::DeserializeOwned;
use serde_json::Value;
use supportdesk_shared::WireMessage;

pub use connection::HubConnection;
pub use listeners::{ListenerRegistry, Subscription};
pub use protocol::HubFrame;
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, ConnectionStateMachine};
pub use transport::{HubLink, HubTransport, WebSocketTransport};

/// Hub method used to post a chat message
pub const SEND_MESSAGE_METHOD: &str = "SendMessage";

/// Hub connection errors
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Failed to connect to hub: {0}")]
    Connect(String),

    #[error("Hub connection closed")]
    ConnectionClosed,

    #[error("Hub invocation '{method}' failed: {message}")]
    Invocation { method: String, message: String },

    #[error("Hub protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hub connection disposed")]
    Disposed,

    #[error("Invalid connection transition '{action}' from state {from}")]
    InvalidTransition { from: String, action: &'static str },
}

impl HubError {
    /// Check if error is transient (worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::Connect(_) | HubError::ConnectionClosed)
    }
}

pub type HubResult<T> = Result<T, HubError>;

/// Closed set of server-to-client events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEventName {
    ReceiveMessage,
}

impl HubEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubEventName::ReceiveMessage => "ReceiveMessage",
        }
    }

    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            "ReceiveMessage" => Some(HubEventName::ReceiveMessage),
            _ => None,
        }
    }
}

impl std::fmt::Display for HubEventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed hub event with its payload
pub trait HubEvent: DeserializeOwned + Send + Sync + 'static {
    const NAME: HubEventName;

    /// Decode the invocation arguments; by default the first argument is the payload
    fn from_arguments(args: &[Value]) -> Result<Self, serde_json::Error> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        serde_json::from_value(first)
    }
}

/// A chat message pushed by the server
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(transparent)]
pub struct ReceiveMessage(pub WireMessage);

impl HubEvent for ReceiveMessage {
    const NAME: HubEventName = HubEventName::ReceiveMessage;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names() {
        assert_eq!(HubEventName::ReceiveMessage.as_str(), "ReceiveMessage");
        assert_eq!(
            HubEventName::from_target("ReceiveMessage"),
            Some(HubEventName::ReceiveMessage)
        );
        assert_eq!(HubEventName::from_target("receivemessage"), None);
    }

    #[test]
    fn test_receive_message_from_arguments() {
        let args = vec![json!({
            "id": "m1",
            "content": "Hi there",
            "sender": "agent",
            "timestamp": "2024-05-01T10:00:00Z"
        })];
        let event = ReceiveMessage::from_arguments(&args).unwrap();
        assert_eq!(event.0.id.as_deref(), Some("m1"));
        assert!(ReceiveMessage::from_arguments(&[]).is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(HubError::Connect("refused".into()).is_transient());
        assert!(HubError::ConnectionClosed.is_transient());
        assert!(!HubError::Disposed.is_transient());
        assert!(!HubError::Invocation {
            method: "SendMessage".into(),
            message: "denied".into()
        }
        .is_transient());
    }
}
