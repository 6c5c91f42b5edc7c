//! The pending change queue.
//!
//! Edits are kept in creation order. Edits touching the same record are
//! never reordered relative to each other; edits of different records may be
//! drained in any order. Every mutation is persisted through
//! [`DurableQueueStore`] before it becomes visible in memory, so a failed
//! write leaves the queue exactly as it was.

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{Edit, RecordId};
use crate::storage::{DurableQueueStore, StorageError};

pub struct ChangeQueue {
    edits: Mutex<Vec<Edit>>,
    store: DurableQueueStore,
}

impl ChangeQueue {
    /// Creates an empty queue backed by `store`.
    pub fn new(store: DurableQueueStore) -> Self {
        Self {
            edits: Mutex::new(Vec::new()),
            store,
        }
    }

    /// Rebuilds the queue from durable storage.
    pub fn rehydrate(store: DurableQueueStore) -> Result<Self, StorageError> {
        let edits = store.load_edits()?;
        tracing::debug!(pending = edits.len(), "rehydrated change queue");
        Ok(Self {
            edits: Mutex::new(edits),
            store,
        })
    }

    pub fn store(&self) -> &DurableQueueStore {
        &self.store
    }

    /// Applies `f` to a copy of the queue, persists it and only then swaps
    /// it in.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Edit>) -> R) -> Result<R, StorageError> {
        let mut guard = self.edits.lock();
        let mut next = guard.clone();
        let result = f(&mut next);
        self.store.save_edits(&next)?;
        *guard = next;
        Ok(result)
    }

    /// Appends an edit. Fails without queueing anything if it cannot be
    /// persisted.
    pub fn enqueue(&self, edit: Edit) -> Result<(), StorageError> {
        self.mutate(|edits| edits.push(edit))
    }

    /// Oldest edit in the queue.
    pub fn peek_front(&self) -> Option<Edit> {
        self.edits.lock().first().cloned()
    }

    /// Oldest edit for a single record.
    pub fn peek_front_for(&self, record_id: &RecordId) -> Option<Edit> {
        self.edits
            .lock()
            .iter()
            .find(|e| &e.record_id == record_id)
            .cloned()
    }

    /// Removes and returns the oldest edit.
    pub fn dequeue(&self) -> Result<Option<Edit>, StorageError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.mutate(|edits| {
            if edits.is_empty() {
                None
            } else {
                Some(edits.remove(0))
            }
        })
    }

    /// Removes a specific edit (acknowledged, rejected or discarded).
    pub fn remove(&self, edit_id: Uuid) -> Result<Option<Edit>, StorageError> {
        if self.get(edit_id).is_none() {
            return Ok(None);
        }
        self.mutate(|edits| {
            let index = edits.iter().position(|e| e.edit_id == edit_id)?;
            Some(edits.remove(index))
        })
    }

    /// Returns a failed edit to the front of its record's sub-sequence with
    /// its attempt count incremented.
    pub fn requeue_front(&self, mut edit: Edit) -> Result<Edit, StorageError> {
        edit.attempt_count += 1;
        let requeued = edit.clone();
        self.mutate(move |edits| {
            let original = edits.iter().position(|e| e.edit_id == edit.edit_id);
            if let Some(index) = original {
                edits.remove(index);
            }
            let first_same = edits.iter().position(|e| e.record_id == edit.record_id);
            let index = match (original, first_same) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => edits.len(),
            };
            edits.insert(index.min(edits.len()), edit);
        })?;
        Ok(requeued)
    }

    /// Swaps an edit for its replacement at the same queue position.
    pub fn replace(&self, edit_id: Uuid, replacement: Edit) -> Result<bool, StorageError> {
        if self.get(edit_id).is_none() {
            return Ok(false);
        }
        self.mutate(|edits| match edits.iter_mut().find(|e| e.edit_id == edit_id) {
            Some(slot) => {
                *slot = replacement;
                true
            }
            None => false,
        })
    }

    /// Moves the record's edits built on `from_version` onto `to_version`.
    ///
    /// Called when one of the client's own edits (or a merge) advanced the
    /// server version, so the following edits are not mistaken for stale.
    pub fn rebase(
        &self,
        record_id: &RecordId,
        from_version: u64,
        to_version: u64,
    ) -> Result<usize, StorageError> {
        if from_version == to_version {
            return Ok(0);
        }
        let affected = self
            .edits
            .lock()
            .iter()
            .filter(|e| &e.record_id == record_id && e.base_version == from_version)
            .count();
        if affected == 0 {
            return Ok(0);
        }
        self.mutate(|edits| {
            for edit in edits
                .iter_mut()
                .filter(|e| &e.record_id == record_id && e.base_version == from_version)
            {
                edit.base_version = to_version;
            }
            affected
        })
    }

    /// The user gave up on an edit before it synced.
    pub fn discard(&self, edit_id: Uuid) -> Result<Option<Edit>, StorageError> {
        let removed = self.remove(edit_id)?;
        if let Some(edit) = &removed {
            tracing::info!(edit_id = %edit.edit_id, record_id = %edit.record_id, "discarded pending edit");
        }
        Ok(removed)
    }

    /// Clears the attempt count of a stalled edit so it is retried again.
    pub fn reset_attempts(&self, edit_id: Uuid) -> Result<Option<Edit>, StorageError> {
        if self.get(edit_id).is_none() {
            return Ok(None);
        }
        self.mutate(|edits| {
            let edit = edits.iter_mut().find(|e| e.edit_id == edit_id)?;
            edit.attempt_count = 0;
            Some(edit.clone())
        })
    }

    /// The next sendable edit of up to `limit` distinct records.
    ///
    /// A record whose head edit is blocked (open conflict) or stalled
    /// (`attempt_count >= max_attempts`) contributes nothing, which keeps
    /// its later edits behind it.
    pub fn ready_heads(
        &self,
        limit: usize,
        blocked: &HashSet<Uuid>,
        max_attempts: u32,
    ) -> Vec<Edit> {
        let edits = self.edits.lock();
        let mut seen: HashSet<&RecordId> = HashSet::new();
        let mut heads = Vec::new();

        for edit in edits.iter() {
            if heads.len() >= limit {
                break;
            }
            if !seen.insert(&edit.record_id) {
                continue;
            }
            if blocked.contains(&edit.edit_id) || edit.attempt_count >= max_attempts {
                continue;
            }
            heads.push(edit.clone());
        }

        heads
    }

    /// Head edits that exhausted their retries.
    pub fn stalled(&self, max_attempts: u32) -> Vec<Edit> {
        let edits = self.edits.lock();
        let mut seen: HashSet<&RecordId> = HashSet::new();
        edits
            .iter()
            .filter(|e| seen.insert(&e.record_id) && e.attempt_count >= max_attempts)
            .cloned()
            .collect()
    }

    /// All pending edits for a record, in creation order.
    pub fn pending_for(&self, record_id: &RecordId) -> Vec<Edit> {
        self.edits
            .lock()
            .iter()
            .filter(|e| &e.record_id == record_id)
            .cloned()
            .collect()
    }

    pub fn has_pending(&self, record_id: &RecordId) -> bool {
        self.edits.lock().iter().any(|e| &e.record_id == record_id)
    }

    pub fn get(&self, edit_id: Uuid) -> Option<Edit> {
        self.edits
            .lock()
            .iter()
            .find(|e| e.edit_id == edit_id)
            .cloned()
    }

    /// Ordered copy of the whole queue.
    pub fn snapshot(&self) -> Vec<Edit> {
        self.edits.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.edits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.lock().is_empty()
    }
}
