mod auth_tests;
mod session_tests;

use async_trait::async_trait;
use panelchat_core::{BrowserContext, ConversationClient, ConversationStore, IdentityStore};
use panelchat_core::{KeyValueStore, MockRemote};
use std::sync::Arc;
use std::sync::Mutex;
use url::Url;

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Everything a panel session is built from, over a given storage backend.
pub(crate) struct Session {
    pub identity: IdentityStore,
    pub client: ConversationClient,
    pub restored: bool,
}

pub(crate) async fn open_session(
    storage: Arc<dyn KeyValueStore>,
    remote: Arc<MockRemote>,
) -> Session {
    let identity = IdentityStore::new(storage.clone());
    let (store, restored) = ConversationStore::load(storage).await.expect("load");
    let client = ConversationClient::new(remote, identity.clone(), store);
    Session {
        identity,
        client,
        restored,
    }
}

#[derive(Default)]
pub(crate) struct RecordingBrowser {
    pub opened: Mutex<Vec<Url>>,
}

#[async_trait]
impl BrowserContext for RecordingBrowser {
    async fn open(&self, url: &Url) -> anyhow::Result<()> {
        self.opened.lock().expect("lock").push(url.clone());
        Ok(())
    }
}
