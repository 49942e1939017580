//! Key-value persistence.
//!
//! Both pieces of durable state (the destination registry and the posted
//! message record) are small JSON objects keyed by destination id. The
//! [`KeyValueStore`] trait captures the contract:
//!
//! - `load` never fails. A missing, empty or corrupt store reads as empty.
//! - `save` replaces the whole mapping and reports failure, because losing a
//!   write means losing track of what to delete next cycle.
//!
//! [`JsonFileStore`] writes atomically (temp file + rename) so a crash
//! mid-write leaves the previous contents intact.

use crate::sink::MessageHandle;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A persisted mapping keyed by destination id.
pub type Mapping<V> = BTreeMap<String, V>;

/// Destination id -> handles currently live at that destination.
pub type PostedMessages = Mapping<HandleList>;

/// Errors that can occur while saving.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable mapping from destination id to a value.
#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Read the whole mapping. Unreadable state reads as empty.
    async fn load(&self) -> Mapping<V>;

    /// Replace the whole mapping.
    async fn save(&self, mapping: &Mapping<V>) -> Result<(), StoreError>;
}

/// Ordered handles for one destination.
///
/// Older message files stored a single id per destination instead of a
/// list; both shapes deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "Vec<MessageHandle>")]
pub struct HandleList(pub Vec<MessageHandle>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(MessageHandle),
    Many(Vec<MessageHandle>),
}

impl From<OneOrMany> for HandleList {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(handle) => HandleList(vec![handle]),
            OneOrMany::Many(handles) => HandleList(handles),
        }
    }
}

impl From<HandleList> for Vec<MessageHandle> {
    fn from(list: HandleList) -> Self {
        list.0
    }
}

impl From<Vec<MessageHandle>> for HandleList {
    fn from(handles: Vec<MessageHandle>) -> Self {
        HandleList(handles)
    }
}

/// JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore<V> {
    path: PathBuf,
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonFileStore<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for JsonFileStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Mapping<V> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Store file not found, starting empty");
                return Mapping::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read store, treating as empty");
                return Mapping::new();
            }
        };

        if content.trim().is_empty() {
            return Mapping::new();
        }

        match serde_json::from_str(&content) {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt store, treating as empty");
                Mapping::new()
            }
        }
    }

    async fn save(&self, mapping: &Mapping<V>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(mapping)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), entries = mapping.len(), "Store saved");
        Ok(())
    }
}

/// In-process store. State is lost on restart.
#[derive(Debug)]
pub struct MemoryStore<V> {
    inner: Mutex<Mapping<V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Mapping::new()),
        }
    }

    pub fn with_mapping(mapping: Mapping<V>) -> Self {
        Self {
            inner: Mutex::new(mapping),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Mapping<V> {
        self.inner.lock().await.clone()
    }

    async fn save(&self, mapping: &Mapping<V>) -> Result<(), StoreError> {
        *self.inner.lock().await = mapping.clone();
        Ok(())
    }
}
