//! Pluggable key/value storage backends.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Errors emitted by storage backends.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StorageError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(solid_authn::storage::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(solid_authn::storage::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(solid_authn::storage::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// A string-valued key/value store.
///
/// Implementations are expected to be cheap to call repeatedly: callers do not cache reads.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Store `value` at `key`, replacing anything already there.
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.as_ref().get(key).await
    }
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.as_ref().set(key, value).await
    }
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.as_ref().delete(key).await
    }
}

/// In-memory storage suitable for short-lived sessions and tests.
#[derive(Clone, Default)]
pub struct MemoryStorage(Arc<RwLock<HashMap<String, String>>>);

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.0.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.0.read().await.get(key).cloned())
    }
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.0.write().await.insert(key.to_owned(), value);
        Ok(())
    }
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.0.write().await.remove(key);
        Ok(())
    }
}

/// File-backed storage keeping every key in a single JSON object.
///
/// NOT secure: the file is plain text. Only use it as the insecure backend, or for
/// development.
#[derive(Clone, Debug)]
pub struct FileStorage {
    /// Path to the JSON file.
    pub path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FileStorage {
    /// Open (or create) a file store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(&path, b"{}")?;
        }
        Ok(Self {
            path,
            lock: Arc::new(RwLock::new(())),
        })
    }

    fn read_map(&self) -> Result<Map<String, Value>, StorageError> {
        let file = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Value>(&file)? {
            Value::Object(map) => Ok(map),
            _ => Err(StorageError::Other("invalid store: expected a JSON object".into())),
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> Result<(), StorageError> {
        std::fs::write(&self.path, serde_json::to_string_pretty(map)?)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.read().await;
        let map = self.read_map()?;
        Ok(map.get(key).and_then(Value::as_str).map(str::to_owned))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let mut map = self.read_map()?;
        map.insert(key.to_owned(), Value::String(value));
        self.write_map(&map)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}
