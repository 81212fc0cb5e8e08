//! Streaming emitter.
//!
//! Frames assistant fragments as newline-delimited JSON. Every fragment becomes
//! `{"content": .., "done": false}` and the stream always ends with exactly one
//! terminal unit: `{"full_content": .., "done": true}` on success, or
//! `{"error": .., "code": .., "done": true}` when producing fragments failed.

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamUnit {
    Fragment {
        content: String,
        done: bool,
    },
    Complete {
        full_content: String,
        done: bool,
    },
    Failed {
        error: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_seq: Option<u64>,
        done: bool,
    },
}

impl StreamUnit {
    pub fn fragment(content: impl Into<String>) -> Self {
        Self::Fragment {
            content: content.into(),
            done: false,
        }
    }

    pub fn complete(full_content: impl Into<String>) -> Self {
        Self::Complete {
            full_content: full_content.into(),
            done: true,
        }
    }

    pub fn failed(error: &ChatError) -> Self {
        Self::Failed {
            error: error.to_string(),
            code: error.code().to_string(),
            user_seq: error.committed_seq(),
            done: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment { .. })
    }
}

struct EmitState<S> {
    fragments: S,
    full: String,
    finished: bool,
}

/// Frame fragments into units, ending with exactly one terminal unit.
///
/// The first error ends the stream; nothing after it is read.
pub fn emit<S>(fragments: S) -> impl Stream<Item = StreamUnit> + Send + 'static
where
    S: Stream<Item = Result<String, ChatError>> + Send + Unpin + 'static,
{
    let state = EmitState {
        fragments,
        full: String::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let unit = match state.fragments.next().await {
            Some(Ok(fragment)) => {
                state.full.push_str(&fragment);
                StreamUnit::fragment(fragment)
            }
            Some(Err(e)) => {
                state.finished = true;
                StreamUnit::failed(&e)
            }
            None => {
                state.finished = true;
                StreamUnit::complete(std::mem::take(&mut state.full))
            }
        };
        Some((unit, state))
    })
}

/// Encode a unit as one NDJSON line.
pub fn encode_line(unit: &StreamUnit) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(unit)?;
    line.push('\n');
    Ok(line)
}

/// Build a chunked `application/x-ndjson` response from assistant fragments.
pub fn ndjson_response<S>(fragments: S) -> Response
where
    S: Stream<Item = Result<String, ChatError>> + Send + Unpin + 'static,
{
    let lines = emit(fragments).map(|unit| encode_line(&unit));
    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response()
}
