//! Session identity and the registry contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Opaque 128-bit session identifier, rendered as a hyphenated UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a textual identifier.
    ///
    /// Only the hyphenated 36-character form is accepted so that one session
    /// has exactly one spelling in storage.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.len() != 36 {
            return Err(StoreError::InvalidSessionId(input.to_string()));
        }
        Uuid::try_parse(trimmed)
            .map(Self)
            .map_err(|_| StoreError::InvalidSessionId(input.to_string()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    /// `None` when sessions do not expire
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the session is still usable at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Maps session identifiers to their existence and lifetime.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Issue a new, never-before-used identifier and record it.
    async fn create(&self) -> Result<Session>;

    /// Look up a session, `None` if unknown or expired.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Whether the session exists and has not expired.
    async fn exists(&self, id: &SessionId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Extend the session's expiry. No-op when sessions do not expire.
    async fn touch(&self, id: &SessionId) -> Result<()>;
}
