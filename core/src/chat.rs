use crate::conversation::{ConversationStore, Turn};
use crate::identity::IdentityStore;
use crate::remote::{ChatRequest, ProtocolError, RemoteService};
use crate::storage::StorageError;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("another message is still awaiting its reply")]
    Busy,
    #[error("client identity unavailable: {0}")]
    Identity(#[from] StorageError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Holds the single pending slot for the lifetime of one exchange. Dropping
/// it, on any path, clears the indicator.
struct PendingGuard {
    pending: Arc<watch::Sender<bool>>,
}

impl PendingGuard {
    fn acquire(pending: &Arc<watch::Sender<bool>>) -> Option<Self> {
        let acquired = pending.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        acquired.then(|| Self {
            pending: pending.clone(),
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.send_replace(false);
    }
}

/// Exchanges conversation turns with the assistant service.
///
/// Only one exchange runs at a time; a second `send` while one is pending is
/// rejected with [`SendError::Busy`] and leaves the transcript untouched.
#[derive(Clone)]
pub struct ConversationClient {
    remote: Arc<dyn RemoteService>,
    identity: IdentityStore,
    store: ConversationStore,
    pending: Arc<watch::Sender<bool>>,
}

impl ConversationClient {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        identity: IdentityStore,
        store: ConversationStore,
    ) -> Self {
        let (pending, _) = watch::channel(false);
        Self {
            remote,
            identity,
            store,
            pending: Arc::new(pending),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.borrow()
    }

    pub fn pending(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    /// Sends one user message and returns the assistant's raw reply.
    ///
    /// The user turn is appended before the request goes out and stays in
    /// the transcript when the exchange fails; no reply turn is added then.
    pub async fn send(&self, message: &str) -> Result<String, SendError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let _pending = PendingGuard::acquire(&self.pending).ok_or(SendError::Busy)?;

        let history = self.store.history();
        let session_id = self.store.session_id();
        self.store.append(Turn::user(message)).await;

        let identity = self.identity.get_or_create().await.map_err(|err| {
            tracing::warn!(%err, "chat exchange skipped without identity");
            SendError::from(err)
        })?;
        let request = ChatRequest {
            message: message.to_string(),
            history,
            session_id,
        };
        tracing::debug!(
            history = request.history.len(),
            session = ?request.session_id,
            "sending chat turn"
        );

        let reply = match self.remote.chat(&identity, &request).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(%err, "chat exchange failed; user turn kept without reply");
                return Err(err.into());
            }
        };

        if request.session_id.as_deref() != Some(reply.session_id.as_str()) {
            tracing::info!(session = %reply.session_id, "session id assigned by service");
        }
        self.store.set_session_id(reply.session_id).await;
        self.store.append(Turn::assistant(reply.response.clone())).await;
        Ok(reply.response)
    }

    /// Starts a new dialogue: the service drops its session (best effort),
    /// the local transcript is cleared and the greeting re-seeded.
    pub async fn reset_conversation(&self, greeting: &str) -> Result<(), SendError> {
        let _pending = PendingGuard::acquire(&self.pending).ok_or(SendError::Busy)?;
        if let Some(session_id) = self.store.session_id() {
            match self.identity.get_or_create().await {
                Ok(identity) => {
                    if let Err(err) = self.remote.clear_session(&identity, &session_id).await {
                        tracing::warn!(%err, session = %session_id, "service did not clear session");
                    }
                }
                Err(err) => tracing::warn!(%err, "session clear skipped without identity"),
            }
        }
        self.store.reset().await;
        self.store.seed_greeting(greeting).await;
        Ok(())
    }
}
