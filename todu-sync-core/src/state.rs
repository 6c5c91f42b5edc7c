//! Client-visible state: server snapshots folded with pending edits.
//!
//! For every record the store keeps the last server-confirmed snapshot and
//! a mirror of the record's pending edits, and maintains
//! `visible == fold(snapshot, pending)` after every change. Reads never
//! wait on sync progress.
//!
//! Subscribers registered with [`LocalStateStore::subscribe`] are called
//! with the new visible state whenever a record changes, whether the change
//! came from an optimistic edit or a confirmed snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::model::{apply_edit, fold, Edit, Record, RecordId};

/// Handle returned by [`LocalStateStore::subscribe`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(Option<&Record>) + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct Entry {
    snapshot: Option<Record>,
    pending: Vec<Edit>,
    visible: Option<Record>,
}

impl Entry {
    fn refold(&mut self) {
        self.visible = fold(self.snapshot.as_ref(), &self.pending);
    }
}

#[derive(Default)]
pub struct LocalStateStore {
    records: RwLock<HashMap<RecordId, Entry>>,
    subscribers: Mutex<HashMap<RecordId, Vec<(SubscriptionId, Callback)>>>,
    next_subscription: AtomicU64,
}

impl LocalStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the store from persisted snapshots and the pending queue.
    ///
    /// Meant to run at start-up before anything subscribes, so no
    /// notifications are sent.
    pub fn hydrate(&self, snapshots: Vec<Record>, pending: &[Edit]) {
        let mut records = self.records.write();
        records.clear();

        for snapshot in snapshots {
            let record_id = snapshot.record_id.clone();
            records.entry(record_id).or_default().snapshot = Some(snapshot);
        }
        for edit in pending {
            records
                .entry(edit.record_id.clone())
                .or_default()
                .pending
                .push(edit.clone());
        }
        for entry in records.values_mut() {
            entry.refold();
        }
    }

    /// Folds an edit onto the visible state and marks the record dirty.
    pub fn apply_optimistic(&self, edit: Edit) {
        let record_id = edit.record_id.clone();
        let visible = {
            let mut records = self.records.write();
            let entry = records.entry(record_id.clone()).or_default();
            entry.visible = apply_edit(entry.visible.take(), &edit);
            entry.pending.push(edit);
            entry.visible.clone()
        };
        self.notify(&record_id, visible.as_ref());
    }

    /// Replaces the server snapshot and replays the record's pending edits
    /// on top of it.
    ///
    /// Returns false (and changes nothing) if `record` is older than the
    /// snapshot already held.
    pub fn apply_server_snapshot(&self, record: Record) -> bool {
        let record_id = record.record_id.clone();
        let visible = {
            let mut records = self.records.write();
            let entry = records.entry(record_id.clone()).or_default();
            if !Self::install_snapshot(entry, record) {
                return false;
            }
            entry.refold();
            entry.visible.clone()
        };
        self.notify(&record_id, visible.as_ref());
        true
    }

    /// Retires an acknowledged edit and installs the confirmed record.
    pub fn acknowledge(&self, edit_id: Uuid, record: Record) {
        let record_id = record.record_id.clone();
        let visible = {
            let mut records = self.records.write();
            let entry = records.entry(record_id.clone()).or_default();
            entry.pending.retain(|e| e.edit_id != edit_id);
            Self::install_snapshot(entry, record);
            entry.refold();
            entry.visible.clone()
        };
        self.notify(&record_id, visible.as_ref());
    }

    /// Drops a pending edit that will never reach the server.
    pub fn remove_pending(&self, record_id: &RecordId, edit_id: Uuid) -> bool {
        let visible = {
            let mut records = self.records.write();
            let Some(entry) = records.get_mut(record_id) else {
                return false;
            };
            let before = entry.pending.len();
            entry.pending.retain(|e| e.edit_id != edit_id);
            if entry.pending.len() == before {
                return false;
            }
            entry.refold();
            entry.visible.clone()
        };
        self.notify(record_id, visible.as_ref());
        true
    }

    /// Swaps a pending edit for a merged replacement, keeping its position.
    pub fn replace_pending(&self, edit_id: Uuid, replacement: Edit) -> bool {
        let record_id = replacement.record_id.clone();
        let visible = {
            let mut records = self.records.write();
            let Some(entry) = records.get_mut(&record_id) else {
                return false;
            };
            let Some(slot) = entry.pending.iter_mut().find(|e| e.edit_id == edit_id) else {
                return false;
            };
            *slot = replacement;
            entry.refold();
            entry.visible.clone()
        };
        self.notify(&record_id, visible.as_ref());
        true
    }

    fn install_snapshot(entry: &mut Entry, record: Record) -> bool {
        if let Some(current) = &entry.snapshot {
            if record.version < current.version {
                tracing::debug!(
                    record_id = %record.record_id,
                    held = current.version,
                    received = record.version,
                    "ignoring stale server snapshot"
                );
                return false;
            }
        }
        entry.snapshot = Some(record);
        true
    }

    /// The folded state of a record; `None` if unknown or deleted.
    pub fn get_visible_state(&self, record_id: &RecordId) -> Option<Record> {
        self.records
            .read()
            .get(record_id)
            .and_then(|entry| entry.visible.as_ref())
            .and_then(Record::live)
            .cloned()
    }

    /// The folded state including tombstones.
    pub fn visible_or_tombstone(&self, record_id: &RecordId) -> Option<Record> {
        self.records
            .read()
            .get(record_id)
            .and_then(|entry| entry.visible.clone())
    }

    /// All live records, ordered by id.
    pub fn visible_records(&self) -> Vec<Record> {
        let records = self.records.read();
        let mut visible: Vec<Record> = records
            .values()
            .filter_map(|entry| entry.visible.as_ref())
            .filter_map(Record::live)
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        visible
    }

    pub fn server_snapshot(&self, record_id: &RecordId) -> Option<Record> {
        self.records
            .read()
            .get(record_id)
            .and_then(|entry| entry.snapshot.clone())
    }

    /// All server snapshots, for persistence.
    pub fn server_snapshots(&self) -> Vec<Record> {
        let records = self.records.read();
        let mut snapshots: Vec<Record> = records
            .values()
            .filter_map(|entry| entry.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        snapshots
    }

    /// Version new edits of this record are based on (0 if never synced).
    pub fn server_version(&self, record_id: &RecordId) -> u64 {
        self.records
            .read()
            .get(record_id)
            .and_then(|entry| entry.snapshot.as_ref())
            .map(|record| record.version)
            .unwrap_or(0)
    }

    pub fn pending_edits(&self, record_id: &RecordId) -> Vec<Edit> {
        self.records
            .read()
            .get(record_id)
            .map(|entry| entry.pending.clone())
            .unwrap_or_default()
    }

    /// True while the record has edits the server has not confirmed.
    pub fn is_dirty(&self, record_id: &RecordId) -> bool {
        self.records
            .read()
            .get(record_id)
            .map(|entry| !entry.pending.is_empty())
            .unwrap_or(false)
    }

    /// Registers a callback for changes to one record.
    pub fn subscribe<F>(&self, record_id: impl Into<RecordId>, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&Record>) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .lock()
            .entry(record_id.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        for callbacks in subscribers.values_mut() {
            let before = callbacks.len();
            callbacks.retain(|(id, _)| *id != subscription);
            removed |= callbacks.len() != before;
        }
        subscribers.retain(|_, callbacks| !callbacks.is_empty());
        removed
    }

    fn notify(&self, record_id: &RecordId, visible: Option<&Record>) {
        // Callbacks run outside the lock so they may read the store.
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .get(record_id)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        let live = visible.and_then(Record::live);
        for callback in callbacks {
            callback(live);
        }
    }
}
