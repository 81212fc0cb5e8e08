//! Colloquy Store - durable conversation history.
//!
//! A session is an opaque UUID; each session owns an append-only log of
//! messages with gap-free sequence positions starting at 1.
//!
//! ```text
//! SessionRegistry ── gates ──► ConversationStore ── rows ──► SQLite (WAL)
//!                                     │
//!                                 codec (Message ⇄ WireMessage)
//! ```
//!
//! Sessions must be created before they can be appended to.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod codec;
pub mod conversation;
pub mod error;
pub mod pool;
pub mod session;
pub mod sqlite;

pub use codec::{decode, encode, Message, MessageMetadata, Role, TokenUsage, WireMessage};
pub use conversation::{Conversation, ConversationStore, Turn};
pub use error::{CodecError, Result, StoreError};
pub use pool::{ConnectionPool, PoolConfig};
pub use session::{Session, SessionId, SessionRegistry};
pub use sqlite::SqliteStore;
