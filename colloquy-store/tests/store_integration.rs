//! Integration tests for the SQLite conversation store.
//!
//! Covers sequence assignment under concurrent appenders, durability across
//! reopen, and read consistency.

use std::collections::HashSet;

use colloquy_store::{
    ConversationStore, PoolConfig, Role, SessionId, SessionRegistry, SqliteStore, StoreError,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(dir.path().join("conversations.db"), PoolConfig::default()).unwrap()
}

#[tokio::test]
async fn test_sequential_appends_are_gap_free() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let session = store.create().await.unwrap();

    for i in 0..25 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .append(&session.id, role, format!("message {i}"), None)
            .await
            .unwrap();
    }

    let messages = store.list(&session.id).await.unwrap();
    let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.content, format!("message {i}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appenders_same_session() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 15;

    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let session = store.create().await.unwrap();

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let store = store.clone();
        let id = session.id;
        handles.push(tokio::spawn(async move {
            let mut seqs = Vec::new();
            for n in 0..PER_WRITER {
                let message = store
                    .append(&id, Role::User, format!("w{writer}-{n}"), None)
                    .await
                    .unwrap();
                seqs.push(message.seq);
            }
            seqs
        }));
    }

    let mut returned = HashSet::new();
    for handle in handles {
        let seqs = handle.await.unwrap();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "writer saw non-increasing positions");
        returned.extend(seqs);
    }
    assert_eq!(returned.len(), WRITERS * PER_WRITER);

    let messages = store.list(&session.id).await.unwrap();
    let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, (1..=(WRITERS * PER_WRITER) as u64).collect::<Vec<_>>());

    // Each writer's own messages keep their relative order.
    for writer in 0..WRITERS {
        let prefix = format!("w{writer}-");
        let mine: Vec<String> = messages
            .iter()
            .filter(|m| m.content.starts_with(&prefix))
            .map(|m| m.content.clone())
            .collect();
        let expected: Vec<String> = (0..PER_WRITER).map(|n| format!("{prefix}{n}")).collect();
        assert_eq!(mine, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let mut sessions = Vec::new();
    for _ in 0..6 {
        sessions.push(store.create().await.unwrap().id);
    }

    let mut handles = Vec::new();
    for id in sessions.clone() {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..10 {
                store
                    .append(&id, Role::User, format!("{id}:{n}"), None)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for id in sessions {
        let messages = store.list(&id).await.unwrap();
        assert_eq!(messages.len(), 10);
        assert!(messages.iter().all(|m| m.session_id == id));
        assert_eq!(messages.last().unwrap().seq, 10);
    }
}

#[tokio::test]
async fn test_messages_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (session_id, written) = {
        let store = open(&dir);
        let session = store.create().await.unwrap();
        store
            .append(&session.id, Role::User, "Hello".into(), None)
            .await
            .unwrap();
        store
            .append(&session.id, Role::Assistant, "Hello! How can I help?".into(), None)
            .await
            .unwrap();
        (session.id, store.list(&session.id).await.unwrap())
    };

    let reopened = open(&dir);
    assert!(reopened.exists(&session_id).await.unwrap());
    assert_eq!(reopened.list(&session_id).await.unwrap(), written);

    let next = reopened
        .append(&session_id, Role::User, "Again".into(), None)
        .await
        .unwrap();
    assert_eq!(next.seq, 3);
}

#[tokio::test]
async fn test_list_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let session = store.create().await.unwrap();
    store
        .append(&session.id, Role::User, "Who is the headmaster?".into(), None)
        .await
        .unwrap();

    let first = store.list(&session.id).await.unwrap();
    let second = store.list(&session.id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unknown_session_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let unknown = SessionId::generate();

    assert!(matches!(
        store.list(&unknown).await,
        Err(StoreError::UnknownSession(_))
    ));
    assert!(matches!(
        store.append(&unknown, Role::User, "hi".into(), None).await,
        Err(StoreError::UnknownSession(_))
    ));
    assert!(!store.exists(&unknown).await.unwrap());
}

#[tokio::test]
async fn test_session_ids_are_unique() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let mut seen = HashSet::new();
    for _ in 0..50 {
        assert!(seen.insert(store.create().await.unwrap().id));
    }
}

#[tokio::test]
async fn test_conversation_turns() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let session = store.create().await.unwrap();

    for (role, content) in [
        (Role::User, "Hello"),
        (Role::Assistant, "Hi"),
        (Role::User, "Still there?"),
    ] {
        store
            .append(&session.id, role, content.into(), None)
            .await
            .unwrap();
    }

    let conversation = store.conversation(&session.id).await.unwrap();
    let turns = conversation.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].assistant.as_ref().unwrap().content, "Hi");
    assert!(turns[1].assistant.is_none());
}
