//! SQLite-backed session registry and conversation store.
//!
//! Appends are serialized per session by an in-process lock and an
//! `IMMEDIATE` transaction that reads `MAX(seq)` and inserts the next position.
//! The `(session_id, seq)` primary key rejects any duplicate that slips past
//! both, so a position is never assigned twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

use crate::codec::{self, format_timestamp, parse_timestamp, Message, MessageMetadata, Role, WireMessage};
use crate::conversation::ConversationStore;
use crate::error::{CodecError, Result, StoreError};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::session::{Session, SessionId, SessionRegistry};

/// Attempts at issuing an unused session identifier.
const CREATE_ATTEMPTS: usize = 3;

/// Lock map size above which dead entries are pruned.
const LOCK_PRUNE_THRESHOLD: usize = 128;

type AppendLocks = Mutex<HashMap<SessionId, Weak<tokio::sync::Mutex<()>>>>;

/// Durable store for sessions and their messages.
///
/// The per-session append lock is awaited before a pooled connection is
/// requested: appends queued on one session hold no connection.
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
    session_ttl: Option<Duration>,
    append_locks: Arc<AppendLocks>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let pool = ConnectionPool::open(path, config)?;
        tracing::info!(path = %pool.path().display(), "Conversation store opened");
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: ConnectionPool) -> Self {
        Self {
            pool,
            session_ttl: None,
            append_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Expire sessions `ttl` after creation or the last [`touch`](SessionRegistry::touch).
    pub fn with_session_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.session_ttl
            .map(|ttl| {
                chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .ok_or_else(|| StoreError::Unavailable(format!("session ttl out of range: {ttl:?}")))
            })
            .transpose()
    }

    fn append_lock(&self, session: &SessionId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .append_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("append lock map poisoned".into()))?;

        if locks.len() > LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(session).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(*session, Arc::downgrade(&lock));
        Ok(lock)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn load_session(conn: &Connection, id: &SessionId) -> Result<Option<Session>> {
    let row = conn
        .query_row(
            "SELECT created_at, expires_at FROM sessions WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    let Some((created_at, expires_at)) = row else {
        return Ok(None);
    };
    Ok(Some(Session {
        id: *id,
        created_at: parse_timestamp(&created_at)?,
        expires_at: expires_at.as_deref().map(parse_timestamp).transpose()?,
    }))
}

/// Fail with `UnknownSession` unless the session exists and is live.
fn require_live_session(conn: &Connection, id: &SessionId) -> Result<Session> {
    match load_session(conn, id)? {
        Some(session) if session.is_live_at(Utc::now()) => Ok(session),
        _ => Err(StoreError::UnknownSession(*id)),
    }
}

fn row_to_wire(row: &rusqlite::Row<'_>) -> rusqlite::Result<(WireMessage, Option<String>)> {
    let seq: i64 = row.get(1)?;
    Ok((
        WireMessage {
            session_id: row.get(0)?,
            seq: u64::try_from(seq).unwrap_or(0),
            id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            created_at: row.get(6)?,
            metadata: None,
        },
        row.get(5)?,
    ))
}

fn decode_row(mut wire: WireMessage, metadata: Option<String>) -> std::result::Result<Message, CodecError> {
    wire.metadata = metadata
        .as_deref()
        .map(serde_json::from_str::<MessageMetadata>)
        .transpose()
        .map_err(|e| CodecError::Decode(format!("bad metadata for seq {}: {e}", wire.seq)))?;
    codec::decode(wire)
}

fn select_messages(conn: &Connection, id: &SessionId) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, seq, id, role, content, metadata, created_at
         FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![id.to_string()], row_to_wire)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (wire, metadata) in rows {
        let message = decode_row(wire, metadata).map_err(|e| {
            tracing::error!(session_id = %id, error = %e, "Stored message failed to decode");
            e
        })?;
        messages.push(message);
    }
    Ok(messages)
}

#[async_trait]
impl SessionRegistry for SqliteStore {
    async fn create(&self) -> Result<Session> {
        let now = Utc::now();
        let expires_at = self.expiry_from(now)?;

        let session = self
            .pool
            .run(move |conn| {
                for attempt in 1..=CREATE_ATTEMPTS {
                    let id = SessionId::generate();
                    let inserted = conn.execute(
                        "INSERT INTO sessions (id, created_at, expires_at) VALUES (?1, ?2, ?3)",
                        params![
                            id.to_string(),
                            format_timestamp(&now),
                            expires_at.as_ref().map(format_timestamp),
                        ],
                    );
                    match inserted {
                        Ok(_) => {
                            return Ok(Session {
                                id,
                                created_at: now,
                                expires_at,
                            })
                        }
                        Err(e) if is_constraint_violation(&e) => {
                            tracing::warn!(session_id = %id, attempt, "Session id collision, retrying");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(StoreError::Unavailable(
                    "could not allocate an unused session id".into(),
                ))
            })
            .await?;

        tracing::info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        let id = *id;
        let session = self.pool.run(move |conn| load_session(conn, &id)).await?;
        Ok(session.filter(|s| s.is_live_at(Utc::now())))
    }

    async fn touch(&self, id: &SessionId) -> Result<()> {
        let Some(expires_at) = self.expiry_from(Utc::now())? else {
            return Ok(());
        };
        let id = *id;
        self.pool
            .run(move |conn| {
                require_live_session(conn, &id)?;
                conn.execute(
                    "UPDATE sessions SET expires_at = ?2 WHERE id = ?1",
                    params![id.to_string(), format_timestamp(&expires_at)],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append(
        &self,
        session: &SessionId,
        role: Role,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message> {
        let id = *session;
        if let Some(metadata) = &metadata {
            metadata.check_reserved_keys()?;
        }
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        let guard = self.append_lock(&id)?.lock_owned().await;
        let message = self
            .pool
            .run(move |conn| {
                let _guard = guard;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                require_live_session(&tx, &id)?;

                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )?;

                let message = Message {
                    id: Uuid::new_v4(),
                    session_id: id,
                    seq: u64::try_from(next)
                        .map_err(|_| StoreError::Unavailable(format!("bad sequence {next}")))?,
                    role,
                    content,
                    created_at: Utc::now(),
                    metadata,
                };

                tx.execute(
                    "INSERT INTO messages (session_id, seq, id, role, content, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id.to_string(),
                        next,
                        message.id.to_string(),
                        message.role.as_str(),
                        message.content,
                        metadata_json,
                        format_timestamp(&message.created_at),
                    ],
                )?;
                tx.commit()?;
                Ok(message)
            })
            .await?;

        tracing::debug!(
            session_id = %message.session_id,
            seq = message.seq,
            role = %message.role,
            "Message appended"
        );
        Ok(message)
    }

    async fn list(&self, session: &SessionId) -> Result<Vec<Message>> {
        let id = *session;
        self.pool
            .run(move |conn| {
                let tx = conn.transaction()?;
                require_live_session(&tx, &id)?;
                let messages = select_messages(&tx, &id)?;
                tx.commit()?;
                Ok(messages)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TokenUsage;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("chat.db"), PoolConfig::default()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_exists() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        assert!(store.exists(&session.id).await.unwrap());
        assert!(session.expires_at.is_none());
        assert!(!store.exists(&SessionId::generate()).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_assigns_positions() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();

        let first = store
            .append(&session.id, Role::User, "Hello".into(), None)
            .await
            .unwrap();
        let second = store
            .append(&session.id, Role::Assistant, "Hi!".into(), None)
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let listed = store.list(&session.id).await.unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[tokio::test]
    async fn test_positions_are_per_session() {
        let (_dir, store) = setup();
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();

        store.append(&a.id, Role::User, "a1".into(), None).await.unwrap();
        store.append(&a.id, Role::User, "a2".into(), None).await.unwrap();
        let b1 = store.append(&b.id, Role::User, "b1".into(), None).await.unwrap();
        assert_eq!(b1.seq, 1);
        assert_eq!(store.list(&b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_empty_session() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        assert!(store.list(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (_dir, store) = setup();
        let unknown = SessionId::generate();

        let err = store
            .append(&unknown, Role::User, "hi".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSession(id) if id == unknown));

        let err = store.list(&unknown).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_metadata_persisted() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        let mut extra = serde_json::Map::new();
        extra.insert("eval_count".into(), serde_json::json!(41));
        let metadata = MessageMetadata {
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 41,
                total_tokens: 51,
            }),
            stop_reason: Some("stop".into()),
            extra,
            ..MessageMetadata::default()
        };

        store
            .append(&session.id, Role::Assistant, "Answer".into(), Some(metadata.clone()))
            .await
            .unwrap();
        let listed = store.list(&session.id).await.unwrap();
        assert_eq!(listed[0].metadata.as_ref(), Some(&metadata));
    }

    #[tokio::test]
    async fn test_expired_session_is_unknown() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("chat.db"), PoolConfig::default())
            .unwrap()
            .with_session_ttl(Some(Duration::ZERO));

        let session = store.create().await.unwrap();
        assert!(session.expires_at.is_some());
        assert!(!store.exists(&session.id).await.unwrap());
        let err = store
            .append(&session.id, Role::User, "late".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_touch_extends_expiry() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("chat.db"), PoolConfig::default())
            .unwrap()
            .with_session_ttl(Some(Duration::from_secs(3600)));

        let session = store.create().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.touch(&session.id).await.unwrap();

        let refreshed = store.get(&session.id).await.unwrap().unwrap();
        assert!(refreshed.expires_at.unwrap() > session.expires_at.unwrap());
    }

    #[tokio::test]
    async fn test_touch_without_ttl_is_noop() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        store.touch(&session.id).await.unwrap();
        store.touch(&SessionId::generate()).await.unwrap();
        assert_eq!(store.get(&session.id).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_corrupt_role_surfaces_as_codec_error() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        let id = session.id;
        store
            .pool()
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO messages (session_id, seq, id, role, content, created_at)
                     VALUES (?1, 1, ?2, 'tool', 'x', ?3)",
                    params![
                        id.to_string(),
                        Uuid::new_v4().to_string(),
                        format_timestamp(&Utc::now())
                    ],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.list(&session.id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Codec(CodecError::UnknownRole(ref role)) if role == "tool"
        ));
    }

    #[tokio::test]
    async fn test_reserved_metadata_rejected_before_write() {
        let (_dir, store) = setup();
        let session = store.create().await.unwrap();
        let mut extra = serde_json::Map::new();
        extra.insert("model".into(), serde_json::json!("other"));
        let metadata = MessageMetadata {
            model: Some("llama3".into()),
            extra,
            ..MessageMetadata::default()
        };

        let err = store
            .append(&session.id, Role::Assistant, "Answer".into(), Some(metadata))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Codec(CodecError::ReservedMetadataKey(ref key)) if key == "model"
        ));

        // Nothing was written, so the history still reads back.
        assert!(store.list(&session.id).await.unwrap().is_empty());
        let next = store
            .append(&session.id, Role::User, "Hello".into(), None)
            .await
            .unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn test_backlogged_session_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(
            dir.path().join("chat.db"),
            PoolConfig {
                max_size: 2,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        store.append(&b.id, Role::User, "b1".into(), None).await.unwrap();

        // Hold session A's append lock and queue more appends than the pool has connections.
        let held = store.append_lock(&a.id).unwrap().lock_owned().await;
        let mut pending = Vec::new();
        for n in 0..3 {
            let store = store.clone();
            let id = a.id;
            pending.push(tokio::spawn(async move {
                store.append(&id, Role::User, format!("a{n}"), None).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let listed = tokio::time::timeout(Duration::from_secs(2), store.list(&b.id))
            .await
            .expect("reading session B waited on session A")
            .unwrap();
        assert_eq!(listed.len(), 1);
        let appended = tokio::time::timeout(
            Duration::from_secs(2),
            store.append(&b.id, Role::Assistant, "b2".into(), None),
        )
        .await
        .expect("appending to session B waited on session A")
        .unwrap();
        assert_eq!(appended.seq, 2);
        assert_eq!(store.pool().in_use(), 0);

        drop(held);
        for handle in pending {
            handle.await.unwrap().unwrap();
        }
        let seqs: Vec<u64> = store.list(&a.id).await.unwrap().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lock_map_prunes_dead_entries() {
        let (_dir, store) = setup();
        for _ in 0..=LOCK_PRUNE_THRESHOLD {
            let _ = store.append_lock(&SessionId::generate()).unwrap();
        }
        assert_eq!(store.append_locks.lock().unwrap().len(), LOCK_PRUNE_THRESHOLD + 1);

        let held = store.append_lock(&SessionId::generate()).unwrap();
        assert_eq!(store.append_locks.lock().unwrap().len(), 1);
        drop(held);
    }
}
