//! Durable record state for the sync server.
//!
//! All records and the ledger of applied edits live in one JSON file:
//! ```text
//! <DATA_DIR>/
//!   records.json
//! ```
//!
//! The file is rewritten (temp file + rename) after every edit that changes
//! state. An edit whose write fails is rolled back.

use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use todu_sync_core::{Applied, BackendState, Edit, Record, RecordId, Rejection};

const RECORDS_FILE: &str = "records.json";

#[derive(Debug)]
pub enum ServerStorageError {
    IoError(PathBuf, io::Error),
    /// records.json exists but is not valid state.
    CorruptState(PathBuf, serde_json::Error),
}

impl std::fmt::Display for ServerStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            ServerStorageError::CorruptState(path, e) => {
                write!(f, "Failed to parse {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ServerStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerStorageError::IoError(_, e) => Some(e),
            ServerStorageError::CorruptState(_, e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub struct RecordStore {
    data_dir: PathBuf,
    state: Mutex<BackendState>,
}

impl RecordStore {
    /// An empty store that will write into `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            state: Mutex::new(BackendState::default()),
        }
    }

    /// Loads the saved state, starting empty if there is none yet.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, ServerStorageError> {
        let store = Self::new(data_dir);
        let path = store.path();

        match fs::read(&path) {
            Ok(bytes) => {
                let state: BackendState = serde_json::from_slice(&bytes)
                    .map_err(|e| ServerStorageError::CorruptState(path.clone(), e))?;
                tracing::info!(
                    records = state.records.len(),
                    applied = state.applied.len(),
                    "loaded record state"
                );
                *store.state.lock() = state;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ServerStorageError::IoError(path, e)),
        }
        Ok(store)
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(RECORDS_FILE)
    }

    /// Applies an edit and persists the result before answering.
    ///
    /// The outer error is a storage failure; the inner result is the
    /// protocol outcome.
    pub fn apply(&self, edit: &Edit) -> Result<Result<Applied, Rejection>, ServerStorageError> {
        let mut state = self.state.lock();
        if let Some(previous) = state.applied.get(&edit.edit_id) {
            return Ok(Ok(previous.clone()));
        }

        let before = state.clone();
        let outcome = state.apply(edit);
        if outcome.is_ok() {
            if let Err(e) = self.save(&state) {
                *state = before;
                return Err(e);
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, record_id: &RecordId) -> Option<Record> {
        self.state.lock().records.get(record_id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    fn save(&self, state: &BackendState) -> Result<(), ServerStorageError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| ServerStorageError::IoError(self.data_dir.clone(), e))?;

        let path = self.path();
        let bytes = serde_json::to_vec(state)
            .map_err(|e| ServerStorageError::CorruptState(path.clone(), e))?;

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| ServerStorageError::IoError(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| ServerStorageError::IoError(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| ServerStorageError::IoError(temp_path.clone(), e))?;

        fs::rename(&temp_path, &path).map_err(|e| ServerStorageError::IoError(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use todu_sync_core::{EntityKind, Fields, RejectReason};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (RecordStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_empty_dir() {
        let (store, temp) = setup();
        assert_eq!(store.record_count(), 0);
        assert!(!temp.path().join(RECORDS_FILE).exists());
    }

    #[test]
    fn test_applied_edits_survive_restart() {
        let (store, temp) = setup();
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk"})));
        store.apply(&create).unwrap().unwrap();
        let toggle = Edit::toggle("gi-milk", EntityKind::GroceryItem, "checked", true, 1);
        store.apply(&toggle).unwrap().unwrap();

        let reopened = RecordStore::open(temp.path()).unwrap();
        let record = reopened.get(&"gi-milk".into()).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.bool_field("checked"), Some(true));

        // The ledger is persisted too: a retried edit is not applied twice.
        let replay = reopened.apply(&toggle).unwrap().unwrap();
        assert_eq!(replay.new_version, 2);
        assert_eq!(reopened.get(&"gi-milk".into()).unwrap().version, 2);
    }

    #[test]
    fn test_rejections_are_not_written() {
        let (store, temp) = setup();
        let update = Edit::update("pm-404", EntityKind::MealPlan, fields(json!({"title": "x"})), 0);

        let rejection = store.apply(&update).unwrap().unwrap_err();
        assert!(matches!(rejection.reason, RejectReason::Validation(_)));
        assert!(!temp.path().join(RECORDS_FILE).exists());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let store = RecordStore::new(&blocker);

        let create = Edit::create("gi-milk", EntityKind::GroceryItem, Fields::new());
        assert!(store.apply(&create).is_err());
        assert!(store.get(&"gi-milk".into()).is_none());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(RECORDS_FILE), b"{not json").unwrap();

        let err = RecordStore::open(temp.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
