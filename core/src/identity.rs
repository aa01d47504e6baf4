use crate::storage::{keys, KeyValueStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Anonymous token identifying this installation to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClientIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owns the `identity.id` record. Created once, never rewritten.
#[derive(Clone)]
pub struct IdentityStore {
    storage: Arc<dyn KeyValueStore>,
    resolved: Arc<OnceCell<ClientIdentity>>,
}

impl IdentityStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            resolved: Arc::new(OnceCell::new()),
        }
    }

    /// Returns the stored identity, creating and persisting one on first use.
    ///
    /// Storage failures are returned to the caller. A fresh identity is only
    /// minted when the key is verifiably absent; regenerating on a read error
    /// would split the installation into several identities.
    pub async fn get_or_create(&self) -> Result<ClientIdentity, StorageError> {
        self.resolved
            .get_or_try_init(|| async {
                match self.storage.get(keys::IDENTITY_ID).await? {
                    Some(Value::String(id)) if !id.is_empty() => Ok(ClientIdentity(id)),
                    Some(other) => Err(StorageError::Corrupt {
                        key: keys::IDENTITY_ID.to_string(),
                        detail: format!("expected a non-empty string, found {other}"),
                    }),
                    None => {
                        let identity = ClientIdentity::generate();
                        self.storage
                            .set(vec![(
                                keys::IDENTITY_ID.to_string(),
                                Value::String(identity.0.clone()),
                            )])
                            .await?;
                        tracing::info!(identity = %identity, "created client identity");
                        Ok(identity)
                    }
                }
            })
            .await
            .cloned()
    }
}
