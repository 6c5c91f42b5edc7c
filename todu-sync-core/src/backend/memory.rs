//! In-process backend with the same semantics as the sync server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Applied, ApplyError, Backend, RejectReason, Rejection};
use crate::model::{apply_edit, Edit, Record, RecordId};

/// Records plus the ledger of applied edits, keyed by `edit_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub records: BTreeMap<RecordId, Record>,
    #[serde(default)]
    pub applied: BTreeMap<Uuid, Applied>,
}

impl BackendState {
    /// Applies an edit with version check, validation and idempotency.
    pub fn apply(&mut self, edit: &Edit) -> Result<Applied, Rejection> {
        if let Some(previous) = self.applied.get(&edit.edit_id) {
            tracing::debug!(edit_id = %edit.edit_id, "edit already applied, replaying result");
            return Ok(previous.clone());
        }

        let current = self.records.get(&edit.record_id);
        let current_version = current.map(|r| r.version).unwrap_or(0);

        edit.validate().map_err(|e| Rejection {
            reason: RejectReason::Validation(e.message),
            current: current.cloned(),
        })?;

        if edit.base_version != current_version {
            return Err(Rejection {
                reason: RejectReason::VersionConflict,
                current: current.cloned(),
            });
        }

        edit.validate_against(current).map_err(|e| Rejection {
            reason: RejectReason::Validation(e.message),
            current: current.cloned(),
        })?;

        let Some(mut record) = apply_edit(current.cloned(), edit) else {
            return Err(Rejection {
                reason: RejectReason::Validation("record does not exist".to_string()),
                current: None,
            });
        };
        record.kind = edit.kind;
        record.version = current_version + 1;
        record.updated_at = edit.created_at;

        let applied = Applied::new(record.clone());
        self.records.insert(record.record_id.clone(), record);
        self.applied.insert(edit.edit_id, applied.clone());
        Ok(applied)
    }
}

/// Thread-safe [`BackendState`] with switches for simulating an unreliable
/// network.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    unreachable: AtomicBool,
    fail_next: AtomicUsize,
    drop_acks: AtomicUsize,
    calls: Mutex<Vec<Uuid>>,
    applications: Mutex<Vec<Uuid>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: BackendState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Seeds a record as if it had been written by another client.
    pub fn insert(&self, record: Record) {
        self.state
            .lock()
            .records
            .insert(record.record_id.clone(), record);
    }

    /// Applies an edit on behalf of another device, bypassing the fault
    /// switches.
    pub fn apply_direct(&self, edit: &Edit) -> Result<Applied, Rejection> {
        let mut state = self.state.lock();
        let first_time = !state.applied.contains_key(&edit.edit_id);
        let applied = state.apply(edit)?;
        if first_time {
            self.applications.lock().push(edit.edit_id);
        }
        Ok(applied)
    }

    pub fn record(&self, record_id: &RecordId) -> Option<Record> {
        self.state.lock().records.get(record_id).cloned()
    }

    pub fn export_state(&self) -> BackendState {
        self.state.lock().clone()
    }

    /// Every call to `apply` refuses with a transient error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `n` calls fail transiently without applying anything.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` successful applies lose their acknowledgement: the edit
    /// is applied but the caller sees a transient error.
    pub fn drop_next_acks(&self, n: usize) {
        self.drop_acks.store(n, Ordering::SeqCst);
    }

    /// Edit ids of every call to `apply`, in order.
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().clone()
    }

    /// Edit ids that actually changed server state, in order.
    pub fn applications(&self) -> Vec<Uuid> {
        self.applications.lock().clone()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn apply(&self, edit: &Edit) -> Result<Applied, ApplyError> {
        self.calls.lock().push(edit.edit_id);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApplyError::Transient("backend unreachable".to_string()));
        }
        if Self::take_one(&self.fail_next) {
            return Err(ApplyError::Transient("connection reset".to_string()));
        }

        let applied = self.apply_direct(edit).map_err(ApplyError::Rejected)?;

        if Self::take_one(&self.drop_acks) {
            return Err(ApplyError::Transient("acknowledgement lost".to_string()));
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, Fields};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_then_update_bumps_version() {
        let backend = MemoryBackend::new();
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk"})));
        let applied = backend.apply(&create).await.unwrap();
        assert_eq!(applied.new_version, 1);

        let toggle = Edit::toggle("gi-milk", EntityKind::GroceryItem, "checked", true, 1);
        let applied = backend.apply(&toggle).await.unwrap();
        assert_eq!(applied.new_version, 2);
        assert_eq!(applied.record.bool_field("checked"), Some(true));
        assert_eq!(applied.record.updated_at, toggle.created_at);
    }

    #[tokio::test]
    async fn test_create_over_tombstone() {
        let backend = MemoryBackend::new();
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk"})));
        backend.apply(&create).await.unwrap();
        backend
            .apply(&Edit::delete("gi-milk", EntityKind::GroceryItem, 1))
            .await
            .unwrap();

        let fresh = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk again"})));
        assert!(matches!(
            backend.apply(&fresh).await,
            Err(ApplyError::Rejected(Rejection {
                reason: RejectReason::VersionConflict,
                ..
            }))
        ));

        let recreate = Edit::recreate("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk again"})), 2);
        let applied = backend.apply(&recreate).await.unwrap();
        assert_eq!(applied.new_version, 3);
        assert!(!applied.record.deleted);
        assert_eq!(applied.record.str_field("name"), Some("Milk again"));
    }

    #[tokio::test]
    async fn test_stale_base_is_a_conflict() {
        let backend = MemoryBackend::new();
        backend.insert(Record::new("pm-003", EntityKind::MealPlan, fields(json!({"title": "Tacos"}))).with_version(3));

        let edit = Edit::update("pm-003", EntityKind::MealPlan, fields(json!({"title": "Fish Tacos"})), 2);
        match backend.apply(&edit).await {
            Err(ApplyError::Rejected(rejection)) => {
                assert_eq!(rejection.reason, RejectReason::VersionConflict);
                assert_eq!(rejection.current.unwrap().version, 3);
            }
            other => panic!("Expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_invalid() {
        let backend = MemoryBackend::new();
        let edit = Edit::update("pm-404", EntityKind::MealPlan, fields(json!({"title": "x"})), 0);
        assert!(matches!(
            backend.apply(&edit).await,
            Err(ApplyError::Rejected(Rejection { reason: RejectReason::Validation(_), .. }))
        ));
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let backend = MemoryBackend::new();
        let create = Edit::create("gl-week", EntityKind::GroceryList, fields(json!({"items": ["milk"]})));
        let first = backend.apply(&create).await.unwrap();
        let second = backend.apply(&create).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.applications(), vec![create.edit_id]);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_lost_ack_applies_once() {
        let backend = MemoryBackend::new();
        backend.drop_next_acks(1);
        let create = Edit::create("gi-eggs", EntityKind::GroceryItem, Fields::new());

        assert!(backend.apply(&create).await.unwrap_err().is_transient());
        assert_eq!(backend.apply(&create).await.unwrap().new_version, 1);
        assert_eq!(backend.applications().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_switches() {
        let backend = MemoryBackend::new();
        let create = Edit::create("gi-eggs", EntityKind::GroceryItem, Fields::new());

        backend.fail_next(2);
        assert!(backend.apply(&create).await.is_err());
        assert!(backend.apply(&create).await.is_err());
        assert!(backend.apply(&create).await.is_ok());

        backend.set_unreachable(true);
        let toggle = Edit::toggle("gi-eggs", EntityKind::GroceryItem, "checked", true, 1);
        assert!(backend.apply(&toggle).await.unwrap_err().is_transient());
        assert!(backend.record(&"gi-eggs".into()).unwrap().bool_field("checked").is_none());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = BackendState::default();
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, Fields::new());
        state.apply(&create).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let restored: BackendState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
        assert!(restored.applied.contains_key(&create.edit_id));
    }
}
