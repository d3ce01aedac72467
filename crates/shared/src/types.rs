//! Common types used across the support desk runtime

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
///
/// The portal identity store hands out opaque string ids, so this is not a Uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
    Automated,
}

impl Default for Sender {
    fn default() -> Self {
        Self::User
    }
}

impl Sender {
    /// Parse a sender from string (case insensitive)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "agent" | "admin" | "support" => Self::Agent,
            "automated" | "bot" | "ai" | "system" => Self::Automated,
            _ => Self::User, // Default to user for unknown senders
        }
    }
}

/// Senders from the server are matched leniently; unknown roles become `User`
impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_str_lossy(&raw))
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Automated => write!(f, "automated"),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Stored reference to an uploaded attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

/// A chat message as seen by the UI
///
/// Immutable once created except for the `read` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: Option<String>,
    pub sender: Sender,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    /// Build a message with a freshly generated id
    pub fn new(sender: Sender, content: Option<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            sender,
            timestamp,
            attachments: Vec::new(),
            read: false,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Message shape used on the wire by both the history endpoint and the
/// `ReceiveMessage` hub event
///
/// History rows carry no id and at most one `attachmentUrl`; live events may
/// carry an id and a full attachment list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        let mut attachments = wire.attachments;
        if let Some(url) = wire.attachment_url {
            if !attachments.iter().any(|a| a.url == url) {
                let name = url.rsplit('/').next().unwrap_or(url.as_str()).to_string();
                attachments.push(Attachment { name, url });
            }
        }

        Self {
            id: wire.id.unwrap_or_else(|| {
                fingerprint_id(wire.sender, wire.timestamp, wire.content.as_deref())
            }),
            content: wire.content,
            sender: wire.sender,
            timestamp: wire.timestamp,
            attachments,
            read: false,
        }
    }
}

/// Stable id for rows the server sends without one
///
/// Derived from sender, timestamp and content so the same row fetched twice
/// maps to the same message.
fn fingerprint_id(sender: Sender, timestamp: OffsetDateTime, content: Option<&str>) -> String {
    let key = format!(
        "{}|{}|{}",
        sender,
        timestamp.unix_timestamp_nanos(),
        content.unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Payload of the `SendMessage` hub method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub content: String,
    pub sender: Sender,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub attachments: Vec<Attachment>,
}

// =============================================================================
// AI assistant
// =============================================================================

/// Request body for `POST /ai/ask`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    pub user_id: UserId,
    pub prompt: String,
}

/// Response body for `POST /ai/ask`
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantResponse {
    pub response: String,
}
