//! Turn orchestration.
//!
//! A turn stores the user message, asks the model, then stores the answer.
//! Turns on one session run one at a time: a per-session lock is held from
//! loading the history until the assistant message is stored (or the turn
//! fails), so two concurrent turns never interleave their halves. Reads do not
//! take the lock.
//!
//! If the model fails or a stream is dropped early, the user message stays
//! stored and no assistant message is written.

use colloquy_common::{Config, SystemPromptPolicy};
use colloquy_store::{
    Conversation, ConversationStore, Message, MessageMetadata, Role, SessionId, SessionRegistry,
    Turn,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;

use crate::error::ChatError;
use crate::provider::{ChatMessage, ChatRequest, FragmentStream, Provider};

/// Assistant text fragments of a turn in progress.
pub type TurnStream = BoxStream<'static, Result<String, ChatError>>;

/// Model call parameters and history policy.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub system_prompt: Option<String>,
    pub system_prompt_policy: SystemPromptPolicy,
    pub max_history_messages: Option<usize>,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.model.clone(),
            temperature: Some(config.model.temperature),
            max_tokens: config.model.max_tokens,
            system_prompt: config.chat.system_prompt.clone(),
            system_prompt_policy: config.chat.system_prompt_policy,
            max_history_messages: config.chat.max_history_messages,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A completed non-streaming turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user: Message,
    pub assistant: Message,
}

/// Per-session turn locks, dropped once no turn holds them.
#[derive(Default)]
struct TurnLocks {
    locks: Mutex<HashMap<SessionId, Weak<tokio::sync::Mutex<()>>>>,
}

impl TurnLocks {
    const PRUNE_THRESHOLD: usize = 128;

    async fn acquire(&self, session: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > Self::PRUNE_THRESHOLD {
                locks.retain(|_, weak| weak.strong_count() > 0);
            }
            match locks.get(session).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(*session, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

/// Stored user message plus everything needed to call the model.
struct PreparedTurn {
    guard: OwnedMutexGuard<()>,
    session: SessionId,
    user: Message,
    request: ChatRequest,
}

/// Drives conversations between the store and the model provider.
pub struct Orchestrator {
    registry: Arc<dyn SessionRegistry>,
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn Provider>,
    settings: TurnSettings,
    turn_locks: TurnLocks,
}

impl Orchestrator {
    /// Build from a store that is both the session registry and the log.
    pub fn new<S>(store: Arc<S>, provider: Arc<dyn Provider>, settings: TurnSettings) -> Self
    where
        S: SessionRegistry + ConversationStore + 'static,
    {
        Self::with_parts(store.clone(), store, provider, settings)
    }

    pub fn with_parts(
        registry: Arc<dyn SessionRegistry>,
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn Provider>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            registry,
            store,
            provider,
            settings,
            turn_locks: TurnLocks::default(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn create_session(&self) -> Result<SessionId, ChatError> {
        Ok(self.registry.create().await?.id)
    }

    /// Every stored message of the session, oldest first.
    pub async fn history(&self, session: &SessionId) -> Result<Vec<Message>, ChatError> {
        Ok(self.store.list(session).await?)
    }

    pub async fn turns(&self, session: &SessionId) -> Result<Vec<Turn>, ChatError> {
        Ok(self.store.conversation(session).await?.turns())
    }

    /// Run one turn and wait for the full answer.
    pub async fn converse(&self, session: SessionId, content: String) -> Result<TurnOutcome, ChatError> {
        let turn = self.begin_turn(session, content).await?;
        let user_seq = turn.user.seq;

        let response = self.provider.chat(turn.request).await.map_err(|e| {
            tracing::warn!(session_id = %session, user_seq, error = %e, "Model call failed");
            ChatError::model_unavailable(e.to_string()).after_commit(user_seq)
        })?;

        let metadata = MessageMetadata {
            usage: Some(response.usage),
            stop_reason: response.finish_reason,
            model: Some(response.model),
            provider: Some(response.provider),
            latency_ms: Some(response.latency_ms),
            ..MessageMetadata::default()
        };
        let assistant = self
            .store
            .append(&turn.session, Role::Assistant, response.content, Some(metadata))
            .await
            .map_err(|e| ChatError::from(e).after_commit(user_seq))?;
        drop(turn.guard);

        tracing::info!(
            session_id = %session,
            user_seq,
            assistant_seq = assistant.seq,
            latency_ms = response.latency_ms,
            "Turn completed"
        );
        Ok(TurnOutcome {
            user: turn.user,
            assistant,
        })
    }

    /// Run one turn, handing out the answer as it is produced.
    ///
    /// Validation, the user append and opening the model stream happen before
    /// this returns. The assistant message is stored when the returned stream
    /// is exhausted, after the last fragment. Dropping the stream early stores
    /// nothing further.
    pub async fn converse_stream(&self, session: SessionId, content: String) -> Result<TurnStream, ChatError> {
        let turn = self.begin_turn(session, content).await?;
        let user_seq = turn.user.seq;

        let fragments = self.provider.chat_stream(turn.request).await.map_err(|e| {
            tracing::warn!(session_id = %session, user_seq, error = %e, "Model stream failed to open");
            ChatError::model_unavailable(e.to_string()).after_commit(user_seq)
        })?;

        let state = StreamingTurn {
            fragments,
            store: Arc::clone(&self.store),
            session,
            user_seq,
            provider: self.provider.name().to_string(),
            model: self.settings.model.clone(),
            started: Instant::now(),
            collected: String::new(),
            fragment_count: 0,
            _guard: turn.guard,
        };

        Ok(stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.fragments.next().await {
                Some(Ok(fragment)) => {
                    state.collected.push_str(&fragment);
                    state.fragment_count += 1;
                    Some((Ok(fragment), Some(state)))
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        session_id = %state.session,
                        user_seq = state.user_seq,
                        fragments = state.fragment_count,
                        error = %e,
                        "Model stream failed mid-response"
                    );
                    let err = ChatError::model_unavailable(e.to_string()).after_commit(state.user_seq);
                    Some((Err(err), None))
                }
                None => match state.finish().await {
                    Ok(()) => None,
                    Err(e) => Some((Err(e), None)),
                },
            }
        })
        .boxed())
    }

    /// Stream an answer to a single prompt without touching any session.
    pub async fn stream_stateless(&self, prompt: String) -> Result<TurnStream, ChatError> {
        if prompt.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![ChatMessage::new(Role::User.as_str(), prompt)],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: self.settings.system_prompt.clone(),
        };
        let fragments = self
            .provider
            .chat_stream(request)
            .await
            .map_err(|e| ChatError::model_unavailable(e.to_string()))?;
        Ok(fragments
            .map(|item| item.map_err(|e| ChatError::model_unavailable(e.to_string())))
            .boxed())
    }

    /// Validate, serialize on the session, and store the user message.
    async fn begin_turn(&self, session: SessionId, content: String) -> Result<PreparedTurn, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let guard = self.turn_locks.acquire(&session).await;
        let history = self.store.conversation(&session).await?;
        self.registry.touch(&session).await?;

        let mut messages = history.into_messages();
        if self.settings.system_prompt_policy == SystemPromptPolicy::PersistOnce && messages.is_empty() {
            if let Some(prompt) = &self.settings.system_prompt {
                let system = self
                    .store
                    .append(&session, Role::System, prompt.clone(), None)
                    .await?;
                messages.push(system);
            }
        }

        let user = self.store.append(&session, Role::User, content, None).await?;
        tracing::debug!(session_id = %session, seq = user.seq, "User message stored");
        messages.push(user.clone());

        let request = self.build_request(&Conversation::new(session, messages));
        Ok(PreparedTurn {
            guard,
            session,
            user,
            request,
        })
    }

    fn build_request(&self, conversation: &Conversation) -> ChatRequest {
        let system = match self.settings.system_prompt_policy {
            SystemPromptPolicy::Ephemeral => self.settings.system_prompt.clone(),
            SystemPromptPolicy::PersistOnce => conversation.system_instruction().map(str::to_string),
        };
        let messages = conversation
            .dialogue_window(self.settings.max_history_messages)
            .into_iter()
            .map(|m| ChatMessage::new(m.role.as_str(), m.content.clone()))
            .collect();

        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system,
        }
    }
}

/// State carried by a streaming turn until its answer is stored.
struct StreamingTurn {
    fragments: FragmentStream,
    store: Arc<dyn ConversationStore>,
    session: SessionId,
    user_seq: u64,
    provider: String,
    model: String,
    started: Instant,
    collected: String,
    fragment_count: usize,
    _guard: OwnedMutexGuard<()>,
}

impl StreamingTurn {
    async fn finish(self) -> Result<(), ChatError> {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let metadata = MessageMetadata {
            model: Some(self.model),
            provider: Some(self.provider),
            latency_ms: Some(latency_ms),
            ..MessageMetadata::default()
        };
        let assistant = self
            .store
            .append(&self.session, Role::Assistant, self.collected, Some(metadata))
            .await
            .map_err(|e| ChatError::from(e).after_commit(self.user_seq))?;

        tracing::info!(
            session_id = %self.session,
            user_seq = self.user_seq,
            assistant_seq = assistant.seq,
            fragments = self.fragment_count,
            latency_ms,
            "Streamed turn completed"
        );
        Ok(())
    }
}
