//! Conversation log contract and derived views.

use async_trait::async_trait;
use serde::Serialize;

use crate::codec::{Message, MessageMetadata, Role};
use crate::error::Result;
use crate::session::SessionId;

/// Append-only, session-partitioned message log.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message at the next sequence position of `session`.
    ///
    /// Positions are assigned atomically with respect to concurrent appends on the
    /// same session and the row is durable before this returns.
    async fn append(
        &self,
        session: &SessionId,
        role: Role,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message>;

    /// All messages of `session` in ascending sequence order.
    async fn list(&self, session: &SessionId) -> Result<Vec<Message>>;

    /// Ordered messages wrapped as a [`Conversation`].
    async fn conversation(&self, session: &SessionId) -> Result<Conversation> {
        Ok(Conversation::new(*session, self.list(session).await?))
    }
}

/// One user message and the assistant message that answered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub user: Message,
    /// `None` while the question is still unanswered
    pub assistant: Option<Message>,
}

/// Materialized, read-only view of a session's messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    session_id: SessionId,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(session_id: SessionId, messages: Vec<Message>) -> Self {
        Self {
            session_id,
            messages,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sequence position of the newest message, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.messages.last().map_or(0, |m| m.seq)
    }

    /// Content of the first stored system message.
    pub fn system_instruction(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// The most recent `limit` user and assistant messages, or all of them
    /// when `limit` is `None`. System messages are never part of the window.
    pub fn dialogue_window(&self, limit: Option<usize>) -> Vec<&Message> {
        let dialogue: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let start = limit.map_or(0, |n| dialogue.len().saturating_sub(n));
        dialogue[start..].to_vec()
    }

    /// Pair each user message with the assistant message directly after it.
    ///
    /// System messages are skipped. A user message followed by another user
    /// message, or by nothing, yields a turn with no assistant.
    pub fn turns(&self) -> Vec<Turn> {
        let mut turns = Vec::new();
        let mut pending: Option<&Message> = None;

        for message in self.messages.iter().filter(|m| m.role != Role::System) {
            match message.role {
                Role::User => {
                    if let Some(user) = pending.replace(message) {
                        turns.push(Turn {
                            user: user.clone(),
                            assistant: None,
                        });
                    }
                }
                Role::Assistant => {
                    // An assistant message with no question before it has no turn.
                    if let Some(user) = pending.take() {
                        turns.push(Turn {
                            user: user.clone(),
                            assistant: Some(message.clone()),
                        });
                    }
                }
                Role::System => {}
            }
        }

        if let Some(user) = pending {
            turns.push(Turn {
                user: user.clone(),
                assistant: None,
            });
        }
        turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn conversation(roles: &[(Role, &str)]) -> Conversation {
        let session_id = SessionId::generate();
        let messages = roles
            .iter()
            .enumerate()
            .map(|(i, (role, content))| Message {
                id: Uuid::new_v4(),
                session_id,
                seq: i as u64 + 1,
                role: *role,
                content: (*content).to_string(),
                created_at: Utc::now(),
                metadata: None,
            })
            .collect();
        Conversation::new(session_id, messages)
    }

    fn contents(turns: &[Turn]) -> Vec<(&str, Option<&str>)> {
        turns
            .iter()
            .map(|t| {
                (
                    t.user.content.as_str(),
                    t.assistant.as_ref().map(|a| a.content.as_str()),
                )
            })
            .collect()
    }

    #[test]
    fn test_turns_pair_in_order() {
        let c = conversation(&[
            (Role::System, "You are helpful"),
            (Role::User, "Hello"),
            (Role::Assistant, "Hi there"),
            (Role::User, "Who is Dobby?"),
            (Role::Assistant, "A house-elf."),
        ]);
        assert_eq!(
            contents(&c.turns()),
            vec![
                ("Hello", Some("Hi there")),
                ("Who is Dobby?", Some("A house-elf.")),
            ]
        );
    }

    #[test]
    fn test_unanswered_users() {
        let c = conversation(&[
            (Role::User, "first"),
            (Role::User, "second"),
            (Role::Assistant, "answer"),
            (Role::User, "third"),
        ]);
        assert_eq!(
            contents(&c.turns()),
            vec![("first", None), ("second", Some("answer")), ("third", None)]
        );
    }

    #[test]
    fn test_orphan_assistant_skipped() {
        let c = conversation(&[(Role::Assistant, "unprompted"), (Role::User, "q")]);
        assert_eq!(contents(&c.turns()), vec![("q", None)]);
    }

    #[test]
    fn test_dialogue_window() {
        let c = conversation(&[
            (Role::System, "sys"),
            (Role::User, "a"),
            (Role::Assistant, "b"),
            (Role::User, "c"),
        ]);
        assert_eq!(c.dialogue_window(None).len(), 3);
        assert_eq!(c.dialogue_window(Some(10)).len(), 3);
        let tail: Vec<&str> = c
            .dialogue_window(Some(2))
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert_eq!(c.system_instruction(), Some("sys"));
        assert_eq!(c.last_seq(), 4);
    }

    #[test]
    fn test_empty() {
        let c = conversation(&[]);
        assert!(c.is_empty());
        assert_eq!(c.last_seq(), 0);
        assert!(c.turns().is_empty());
        assert!(c.system_instruction().is_none());
        assert!(c.dialogue_window(Some(3)).is_empty());
    }
}
