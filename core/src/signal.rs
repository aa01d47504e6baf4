use tokio::sync::broadcast;

/// Payload the login window posts back once the external flow has finished.
pub const AUTH_SUCCESS_MARKER: &str = "auth_success";

const BUS_CAPACITY: usize = 32;

/// Messages delivered to the panel from other browser contexts.
///
/// The host posts everything the panel surface receives, unrelated traffic
/// included; listeners are responsible for filtering.
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<String>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Returns how many listeners saw the message.
    pub fn post(&self, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        match self.tx.send(payload) {
            Ok(listeners) => listeners,
            Err(broadcast::error::SendError(payload)) => {
                tracing::debug!(%payload, "cross-context message had no listener");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
