use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Well-known keys of the durable local state.
pub mod keys {
    pub const IDENTITY_ID: &str = "identity.id";
    pub const CONVERSATION_HISTORY: &str = "conversation.history";
    pub const CONVERSATION_SESSION_ID: &str = "conversation.sessionId";
}

const STATE_FILE: &str = "state.json";

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored value for `{key}` is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value state shared by the identity and conversation stores.
///
/// All entries passed to a single [`KeyValueStore::set`] call land in one
/// snapshot; a concurrent reader never observes half of them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, entries: Vec<(String, Value)>) -> Result<(), StorageError>;
    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// Stores every key in a single JSON document under the data directory.
pub struct FileStore {
    root: PathBuf,
    cache: Mutex<Map<String, Value>>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let path = root.join(STATE_FILE);
        let cache = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => map,
                other => {
                    return Err(StorageError::Corrupt {
                        key: STATE_FILE.to_string(),
                        detail: format!("expected an object, found {other}"),
                    })
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(path = %path.display(), keys = cache.len(), "opened state file");
        Ok(Self {
            root,
            cache: Mutex::new(cache),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    async fn write_snapshot(&self, snapshot: Vec<u8>) -> Result<(), StorageError> {
        // Unique temp name: overlapping writes must not clobber each other's
        // temp file before the rename.
        let tmp = self.root.join(format!(".{STATE_FILE}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, snapshot).await?;
        if let Err(err) = tokio::fs::rename(&tmp, self.state_path()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.cache.lock().get(key).cloned())
    }

    async fn set(&self, entries: Vec<(String, Value)>) -> Result<(), StorageError> {
        let snapshot = {
            let mut cache = self.cache.lock();
            for (key, value) in entries {
                cache.insert(key, value);
            }
            serde_json::to_vec_pretty(&*cache)?
        };
        self.write_snapshot(snapshot).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let snapshot = {
            let mut cache = self.cache.lock();
            for key in keys {
                cache.remove(*key);
            }
            serde_json::to_vec_pretty(&*cache)?
        };
        self.write_snapshot(snapshot).await
    }
}

/// In-process store for tests and smoke runs. Reads and writes can be made
/// to fail on demand.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw view of a stored value, bypassing failure injection.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn check_writes(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".to_string()));
        }
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, entries: Vec<(String, Value)>) -> Result<(), StorageError> {
        self.check_writes()?;
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        self.check_writes()?;
        let mut map = self.entries.lock();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}
