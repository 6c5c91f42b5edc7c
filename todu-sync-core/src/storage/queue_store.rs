//! Persistence of the sync state on top of a [`KeyValueStore`].
//!
//! Layout:
//! ```text
//! pending_edits     # ordered list of not-yet-acknowledged edits
//! server_snapshots  # last confirmed server record per record id
//! conflicts         # conflicts waiting for the user
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{KeyValueStore, StorageError};
use crate::model::{Edit, Record};
use crate::resolver::ConflictRecord;

const PENDING_EDITS_KEY: &str = "pending_edits";
const SNAPSHOTS_KEY: &str = "server_snapshots";
const CONFLICTS_KEY: &str = "conflicts";

/// Durable home of the pending queue, server snapshots and open conflicts.
#[derive(Clone)]
pub struct DurableQueueStore {
    store: Arc<dyn KeyValueStore>,
}

impl DurableQueueStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The underlying key-value store.
    pub fn backing_store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn load_edits(&self) -> Result<Vec<Edit>, StorageError> {
        Ok(self.read_json(PENDING_EDITS_KEY)?.unwrap_or_default())
    }

    /// Replaces the persisted queue. Returns once the write is durable.
    pub fn save_edits(&self, edits: &[Edit]) -> Result<(), StorageError> {
        self.write_json(PENDING_EDITS_KEY, &edits)
    }

    pub fn load_snapshots(&self) -> Result<Vec<Record>, StorageError> {
        Ok(self.read_json(SNAPSHOTS_KEY)?.unwrap_or_default())
    }

    pub fn save_snapshots(&self, snapshots: &[Record]) -> Result<(), StorageError> {
        self.write_json(SNAPSHOTS_KEY, &snapshots)
    }

    pub fn load_conflicts(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        Ok(self.read_json(CONFLICTS_KEY)?.unwrap_or_default())
    }

    pub fn save_conflicts(&self, conflicts: &[ConflictRecord]) -> Result<(), StorageError> {
        if conflicts.is_empty() {
            return self.store.delete(CONFLICTS_KEY);
        }
        self.write_json(CONFLICTS_KEY, &conflicts)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.store.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Decode(key.to_string(), e.to_string())),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::Encode(key.to_string(), e.to_string()))?;
        self.store.set(key, &bytes)
    }
}
