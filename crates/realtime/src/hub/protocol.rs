//! JSON hub protocol frames
//!
//! Every frame is a JSON object terminated by the ASCII record separator
//! (0x1E). The numeric `type` field selects the frame kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::HubError;

/// Frame terminator
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const STREAM_ITEM: u8 = 2;
const COMPLETION: u8 = 3;
const STREAM_INVOCATION: u8 = 4;
const CANCEL_INVOCATION: u8 = 5;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// A decoded hub frame
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// Method call. Client to server carries an id when a completion is
    /// expected; server to client events carry none.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Result of an invocation
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Keep-alive
    Ping,
    /// Server is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubFrame {
    /// Serialize including the trailing record separator
    pub fn encode(&self) -> Result<String, HubError> {
        let raw = match self {
            HubFrame::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawFrame {
                kind: INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubFrame::Completion {
                invocation_id,
                result,
                error,
            } => RawFrame {
                kind: COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            HubFrame::Ping => RawFrame {
                kind: PING,
                ..Default::default()
            },
            HubFrame::Close {
                error,
                allow_reconnect,
            } => RawFrame {
                kind: CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..Default::default()
            },
        };

        let mut text = serde_json::to_string(&raw)?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }

    /// Parse one frame (without its separator)
    ///
    /// Stream frames are not used by this client and decode to `None`.
    pub fn decode(json: &str) -> Result<Option<HubFrame>, HubError> {
        let raw: RawFrame = serde_json::from_str(json)?;
        let frame = match raw.kind {
            INVOCATION => Some(HubFrame::Invocation {
                invocation_id: raw.invocation_id,
                target: raw
                    .target
                    .ok_or_else(|| HubError::Protocol("invocation without target".to_string()))?,
                arguments: raw.arguments.unwrap_or_default(),
            }),
            COMPLETION => Some(HubFrame::Completion {
                invocation_id: raw.invocation_id.ok_or_else(|| {
                    HubError::Protocol("completion without invocationId".to_string())
                })?,
                result: raw.result,
                error: raw.error,
            }),
            PING => Some(HubFrame::Ping),
            CLOSE => Some(HubFrame::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            STREAM_ITEM | STREAM_INVOCATION | CANCEL_INVOCATION => None,
            other => {
                return Err(HubError::Protocol(format!("unknown frame type {}", other)));
            }
        };
        Ok(frame)
    }
}

/// Handshake request sent right after the socket opens
pub fn handshake_request() -> String {
    let mut text = serde_json::json!({ "protocol": "json", "version": 1 }).to_string();
    text.push(RECORD_SEPARATOR);
    text
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Check the server's handshake reply
pub fn parse_handshake_response(json: &str) -> Result<(), HubError> {
    let response: HandshakeResponse = serde_json::from_str(json)?;
    match response.error {
        Some(error) => Err(HubError::Connect(format!("handshake rejected: {}", error))),
        None => Ok(()),
    }
}

/// Splits incoming text into separator-terminated records
///
/// Text after the last separator is kept until the next push.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every complete record
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let Some(last) = self.buffer.rfind(RECORD_SEPARATOR) else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last + RECORD_SEPARATOR.len_utf8());
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}
