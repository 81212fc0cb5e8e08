//! Message model and its wire form.
//!
//! The wire form is what the HTTP layer returns and what the SQLite rows are
//! rebuilt into before decoding, so persisted and transmitted messages share one
//! decoding path. Unknown metadata keys survive a round trip untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CodecError;
use crate::session::SessionId;

/// Closed set of speaker roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CodecError;

    /// Exact, case-sensitive match. Anything else is an error, never a default.
    fn from_str(s: &str) -> Result<Self, CodecError> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(CodecError::UnknownRole(other.to_string())),
        }
    }
}

/// Token accounting reported by the model backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Provider-specific details attached to assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Keys this version does not know about, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    /// Keys written by the typed fields. `extra` must not use them.
    pub const RESERVED_KEYS: [&'static str; 5] =
        ["usage", "stop_reason", "model", "provider", "latency_ms"];

    /// Reject `extra` keys that would serialize alongside a typed field.
    pub fn check_reserved_keys(&self) -> Result<(), CodecError> {
        match Self::RESERVED_KEYS
            .iter()
            .find(|key| self.extra.contains_key(**key))
        {
            Some(key) => Err(CodecError::ReservedMetadataKey((*key).to_string())),
            None => Ok(()),
        }
    }
}

/// One entry of a session's append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: SessionId,
    /// 1-based position within the session, gap-free
    pub seq: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<MessageMetadata>,
}

/// Serialized shape of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub session_id: String,
    pub seq: u64,
    pub role: String,
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Render a timestamp with full sub-second precision so it parses back identically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CodecError::Decode(format!("bad timestamp {raw:?}: {e}")))
}

/// Convert a message into its wire form.
pub fn encode(message: &Message) -> WireMessage {
    WireMessage {
        id: message.id.hyphenated().to_string(),
        session_id: message.session_id.to_string(),
        seq: message.seq,
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        created_at: format_timestamp(&message.created_at),
        metadata: message.metadata.clone(),
    }
}

/// Rebuild a message from its wire form.
pub fn decode(wire: WireMessage) -> Result<Message, CodecError> {
    let role: Role = wire.role.parse()?;
    let id = Uuid::try_parse(&wire.id)
        .map_err(|e| CodecError::Decode(format!("bad message id {:?}: {e}", wire.id)))?;
    let session_id = SessionId::parse(&wire.session_id)
        .map_err(|_| CodecError::Decode(format!("bad session id {:?}", wire.session_id)))?;
    if wire.seq == 0 {
        return Err(CodecError::Decode("sequence positions start at 1".into()));
    }

    Ok(Message {
        id,
        session_id,
        seq: wire.seq,
        role,
        content: wire.content,
        created_at: parse_timestamp(&wire.created_at)?,
        metadata: wire.metadata,
    })
}

/// Encode straight to JSON text.
pub fn encode_json(message: &Message) -> Result<String, CodecError> {
    if let Some(metadata) = &message.metadata {
        metadata.check_reserved_keys()?;
    }
    serde_json::to_string(&encode(message)).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Decode from JSON text.
pub fn decode_json(raw: &str) -> Result<Message, CodecError> {
    let wire: WireMessage =
        serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))?;
    decode(wire)
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(metadata) = &self.metadata {
            metadata
                .check_reserved_keys()
                .map_err(serde::ser::Error::custom)?;
        }
        encode(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        decode(wire).map_err(serde::de::Error::custom)
    }
}
