use crate::storage::{keys, KeyValueStore, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One message of the transcript. `content` is always the raw text: plain
/// text for the user, unrendered markup for the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn is_markup(&self) -> bool {
        self.role == TurnRole::Assistant
    }
}

/// On-disk shape of a turn inside `conversation.history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTurn {
    text: String,
    is_user_turn: bool,
    #[serde(default)]
    is_markup: bool,
}

impl From<&Turn> for StoredTurn {
    fn from(turn: &Turn) -> Self {
        Self {
            text: turn.content.clone(),
            is_user_turn: turn.role == TurnRole::User,
            is_markup: turn.is_markup(),
        }
    }
}

impl From<StoredTurn> for Turn {
    fn from(stored: StoredTurn) -> Self {
        let role = if stored.is_user_turn {
            TurnRole::User
        } else {
            TurnRole::Assistant
        };
        Turn::new(role, stored.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub session_id: Option<String>,
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Owns the durable transcript and the server-assigned session id.
///
/// The in-memory conversation is authoritative. Every mutation writes the
/// full snapshot through to storage; a failed write is logged and the next
/// mutation (or [`ConversationStore::flush`]) writes everything again.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<RwLock<Conversation>>,
    storage: Arc<dyn KeyValueStore>,
    dirty: Arc<AtomicBool>,
}

impl ConversationStore {
    /// Restores the persisted snapshot. The flag is `false` when nothing was
    /// stored yet, in which case the caller is expected to seed a greeting.
    pub async fn load(storage: Arc<dyn KeyValueStore>) -> Result<(Self, bool), StorageError> {
        let history = storage.get(keys::CONVERSATION_HISTORY).await?;
        let session = storage.get(keys::CONVERSATION_SESSION_ID).await?;
        let restored = history.as_ref().is_some_and(|value| !value.is_null());

        let turns = match history {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value::<Vec<StoredTurn>>(value)
                .map_err(|err| StorageError::Corrupt {
                    key: keys::CONVERSATION_HISTORY.to_string(),
                    detail: err.to_string(),
                })?
                .into_iter()
                .map(Turn::from)
                .collect(),
        };
        let session_id = match session {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };
        tracing::debug!(turns = turns.len(), has_session = session_id.is_some(), "loaded conversation");

        let store = Self::detached(storage, Conversation { session_id, turns });
        Ok((store, restored))
    }

    /// Builds a store around an already known conversation without reading
    /// storage. Used when the initial load failed and the session continues
    /// from memory.
    pub fn detached(storage: Arc<dyn KeyValueStore>, conversation: Conversation) -> Self {
        Self {
            inner: Arc::new(RwLock::new(conversation)),
            storage,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Appends the welcome turn if, and only if, the transcript is empty.
    pub async fn seed_greeting(&self, greeting: &str) -> bool {
        {
            let mut inner = self.inner.write();
            if !inner.turns.is_empty() {
                return false;
            }
            inner.turns.push(Turn::assistant(greeting));
        }
        self.persist().await;
        true
    }

    pub async fn append(&self, turn: Turn) {
        self.inner.write().turns.push(turn);
        self.persist().await;
    }

    pub async fn set_session_id(&self, id: impl Into<String>) {
        self.inner.write().session_id = Some(id.into());
        self.persist().await;
    }

    /// Drops every turn and the session id, in memory and in storage.
    pub async fn reset(&self) {
        {
            let mut inner = self.inner.write();
            inner.turns.clear();
            inner.session_id = None;
        }
        let result = self
            .storage
            .remove(&[keys::CONVERSATION_HISTORY, keys::CONVERSATION_SESSION_ID])
            .await;
        self.record_outcome(result);
    }

    /// Retries a failed persist without waiting for the next mutation.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let result = self.write_snapshot().await;
        if result.is_ok() {
            self.dirty.store(false, Ordering::SeqCst);
        }
        result
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Raw turns in chronological order, as sent to the remote service.
    pub fn history(&self) -> Vec<Turn> {
        self.inner.read().turns.clone()
    }

    pub fn snapshot(&self) -> Conversation {
        self.inner.read().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().turns.is_empty()
    }

    async fn persist(&self) {
        let result = self.write_snapshot().await;
        self.record_outcome(result);
    }

    fn record_outcome(&self, result: Result<(), StorageError>) {
        match result {
            Ok(()) => {
                if self.dirty.swap(false, Ordering::SeqCst) {
                    tracing::info!("conversation snapshot persisted after earlier failure");
                }
            }
            Err(err) => {
                self.dirty.store(true, Ordering::SeqCst);
                tracing::warn!(%err, "failed to persist conversation; keeping in-memory state");
            }
        }
    }

    async fn write_snapshot(&self) -> Result<(), StorageError> {
        let entries = {
            let inner = self.inner.read();
            let history: Vec<StoredTurn> = inner.turns.iter().map(StoredTurn::from).collect();
            let session = inner
                .session_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null);
            vec![
                (
                    keys::CONVERSATION_HISTORY.to_string(),
                    serde_json::to_value(history)?,
                ),
                (keys::CONVERSATION_SESSION_ID.to_string(), session),
            ]
        };
        self.storage.set(entries).await
    }
}
