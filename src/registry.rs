//! Destination registry.
//!
//! The persisted set of destinations that receive notifications. Stored as
//! `{"<destination id>": true, ...}`; membership is enablement, an entry
//! with `false` counts as not registered.
//!
//! Only the command surface mutates the registry. The synchronizer reads it
//! once per cycle.

use crate::store::{KeyValueStore, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct DestinationRegistry {
    store: Arc<dyn KeyValueStore<bool>>,
    /// Serializes read-modify-write cycles from concurrent commands
    write_lock: Mutex<()>,
}

impl DestinationRegistry {
    pub fn new(store: Arc<dyn KeyValueStore<bool>>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// All registered destination ids.
    pub async fn list(&self) -> BTreeSet<String> {
        self.store
            .load()
            .await
            .into_iter()
            .filter_map(|(id, enabled)| enabled.then_some(id))
            .collect()
    }

    pub async fn contains(&self, destination: &str) -> bool {
        self.store.load().await.get(destination).copied().unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start tracking a destination.
    ///
    /// Returns `true` if it was newly added. Adding a member again is a
    /// no-op success.
    pub async fn add(&self, destination: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut mapping = self.store.load().await;

        if mapping.get(destination).copied().unwrap_or(false) {
            return Ok(false);
        }

        mapping.insert(destination.to_string(), true);
        self.store.save(&mapping).await?;
        info!(destination = %destination, "Destination tracking enabled");
        Ok(true)
    }

    /// Stop tracking a destination.
    ///
    /// Returns `true` if it was a member. Removing a non-member is a no-op
    /// success.
    pub async fn remove(&self, destination: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut mapping = self.store.load().await;

        match mapping.remove(destination) {
            Some(enabled) => {
                self.store.save(&mapping).await?;
                if enabled {
                    info!(destination = %destination, "Destination tracking disabled");
                }
                Ok(enabled)
            }
            None => Ok(false),
        }
    }
}
