//! Error types for the conversation store.

use thiserror::Error;

use crate::session::SessionId;

/// Failures converting between [`Message`](crate::Message) and its wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The role tag is not one of `system`, `user`, `assistant`
    #[error("Unknown message role: {0:?}")]
    UnknownRole(String),

    /// An `extra` metadata key shadows one of the typed metadata fields
    #[error("Metadata key {0:?} is reserved")]
    ReservedMetadataKey(String),

    /// Any other malformed field
    #[error("Malformed message: {0}")]
    Decode(String),
}

/// Errors from the session registry and conversation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Session identifier is not a well-formed UUID
    #[error("Invalid session_id: {0}")]
    InvalidSessionId(String),

    /// Well-formed identifier that was never created or has expired
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// A persisted row could not be decoded
    #[error("Corrupt conversation data: {0}")]
    Codec(#[from] CodecError),

    /// The database could not be reached or the write did not commit
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Client-side errors are detected before any storage access.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidSessionId(_) | Self::UnknownSession(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("database task failed: {e}"))
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
