//! Envelope — the structured body of a data-kind exchange.
//!
//! Envelopes are decoded once, after an unsolicited data exchange has been
//! fully reassembled. Individual packets never carry envelope structure.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Width of an action tag on the wire.
pub const ACTION_TAG_LEN: usize = 18;

/// What an envelope asks the receiving peer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Action {
    ListRequest,
    ListResponse,
    DownloadRequest,
    DownloadResponse,
    CancelRequest,
    CancelResponse,
    DirectData,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::ListRequest,
        Action::ListResponse,
        Action::DownloadRequest,
        Action::DownloadResponse,
        Action::CancelRequest,
        Action::CancelResponse,
        Action::DirectData,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Action::ListRequest => "list_request",
            Action::ListResponse => "list_response",
            Action::DownloadRequest => "download_request",
            Action::DownloadResponse => "download_response",
            Action::CancelRequest => "cancel_request",
            Action::CancelResponse => "cancel_response",
            Action::DirectData => "direct_data",
        }
    }

    /// The fixed-width tag: the name left-padded with `0`.
    pub fn tag(&self) -> String {
        format!("{:0>width$}", self.name(), width = ACTION_TAG_LEN)
    }

    pub fn from_tag(tag: &str) -> Result<Self, EnvelopeError> {
        Action::ALL
            .into_iter()
            .find(|action| action.tag() == tag)
            .ok_or_else(|| EnvelopeError::UnknownAction(tag.to_owned()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for Action {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Action::from_tag(&value)
    }
}

impl From<Action> for String {
    fn from(action: Action) -> String {
        action.tag()
    }
}

/// Structured payload of a data-kind exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Redundant with the packet key; kept so correlation survives reassembly.
    pub message_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Envelope {
    pub fn new(action: Action, content: Option<String>, message_key: Key) -> Self {
        Self {
            action,
            content,
            message_key,
            error_code: None,
        }
    }

    pub fn with_error(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Decode a reassembled payload. `key` is the exchange key the payload
    /// arrived under and overrides whatever the body claims.
    pub fn from_bytes(bytes: &[u8], key: Key) -> Result<Self, EnvelopeError> {
        let mut envelope: Envelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
        envelope.message_key = key;
        Ok(envelope)
    }
}

/// Body of a direct-data envelope when it carries a chat-style message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Seconds since the Unix epoch at creation.
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: DirectKind,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectKind {
    Common,
    DeviceName,
}

impl DirectMessage {
    pub fn new(kind: DirectKind, content: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            timestamp,
            kind,
            content: Some(content.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_json(s: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(s).map_err(EnvelopeError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown action tag {0:?}")]
    UnknownAction(String),
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(serde_json::Error),
}
