//! Error types for the chat gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use colloquy_store::{CodecError, StoreError};
use serde::{Deserialize, Serialize};

/// Errors surfaced by the chat endpoints.
///
/// `user_seq` is set on upstream failures that happened after the user message
/// was stored: resubmitting would store it a second time.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Missing '{0}' parameter")]
    MissingField(&'static str),

    #[error("Invalid session_id: {0}")]
    InvalidSessionId(String),

    #[error("session_id header does not match request body")]
    SessionMismatch,

    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Stored conversation is corrupt: {0}")]
    CorruptHistory(String),

    #[error("Model unavailable: {message}")]
    ModelUnavailable {
        message: String,
        user_seq: Option<u64>,
    },

    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        user_seq: Option<u64>,
    },
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_seq: Option<u64>,
}

impl ChatError {
    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            message: message.into(),
            user_seq: None,
        }
    }

    /// Mark an upstream failure as happening after the user message at `seq` was stored.
    pub fn after_commit(self, seq: u64) -> Self {
        match self {
            Self::ModelUnavailable { message, .. } => Self::ModelUnavailable {
                message,
                user_seq: Some(seq),
            },
            Self::StoreUnavailable { message, .. } => Self::StoreUnavailable {
                message,
                user_seq: Some(seq),
            },
            other => other,
        }
    }

    /// Sequence position of the stored user message, if the failure came after it.
    pub fn committed_seq(&self) -> Option<u64> {
        match self {
            Self::ModelUnavailable { user_seq, .. } | Self::StoreUnavailable { user_seq, .. } => {
                *user_seq
            }
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingField(_)
            | Self::InvalidSessionId(_)
            | Self::SessionMismatch
            | Self::EmptyMessage => StatusCode::BAD_REQUEST,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::CorruptHistory(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ModelUnavailable { .. } | Self::StoreUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "MISSING_FIELD",
            Self::InvalidSessionId(_) => "INVALID_SESSION_ID",
            Self::SessionMismatch => "SESSION_MISMATCH",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::UnknownSession(_) => "UNKNOWN_SESSION",
            Self::CorruptHistory(_) => "CORRUPT_HISTORY",
            Self::ModelUnavailable { .. } => "MODEL_UNAVAILABLE",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
        }
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        let user_seq = self.committed_seq();
        ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            committed: user_seq.is_some(),
            user_seq,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidSessionId(raw) => Self::InvalidSessionId(raw),
            StoreError::UnknownSession(id) => Self::UnknownSession(id.to_string()),
            StoreError::Codec(codec) => Self::CorruptHistory(codec.to_string()),
            StoreError::Unavailable(message) => Self::StoreUnavailable {
                message,
                user_seq: None,
            },
        }
    }
}

impl From<CodecError> for ChatError {
    fn from(e: CodecError) -> Self {
        Self::CorruptHistory(e.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        (status, axum::Json(self.to_response_body())).into_response()
    }
}
