use thiserror::Error;
use uuid::Uuid;

use crate::model::{RecordId, ValidationError};
use crate::storage::StorageError;

/// Errors returned by the [`SyncCoordinator`](crate::SyncCoordinator)
/// user-action surface.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The change could not be persisted and was not applied.
    #[error("change not saved: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid edit: {0}")]
    Validation(#[from] ValidationError),

    #[error("record not found: {0}")]
    UnknownRecord(RecordId),

    #[error("no pending edit with id {0}")]
    UnknownEdit(Uuid),

    #[error("no open conflict with id {0}")]
    UnknownConflict(Uuid),

    #[error("cannot keep local change: {0}")]
    Unresolvable(String),
}

impl SyncError {
    /// True when the user's change was not saved at all.
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}
