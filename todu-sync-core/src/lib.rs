//! Todu Sync Core Library
//!
//! Offline-first synchronization for Todu Fit clients: a durable queue of
//! pending edits, optimistic local state, a draining coordinator with
//! retry/backoff, and declared conflict resolution.

pub mod backend;
pub mod clock;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod state;
pub mod storage;

pub use backend::{
    check_server, Applied, ApplyError, Backend, BackendState, HttpBackend, MemoryBackend,
    RejectReason, Rejection,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use coordinator::{
    DrainReport, Phase, SyncCoordinator, SyncEvent, SyncOptions, SyncSession, SyncStatus,
};
pub use error::SyncError;
pub use model::{apply_edit, fold, Edit, EntityKind, Fields, OpKind, Record, RecordId, ValidationError};
pub use queue::ChangeQueue;
pub use resolver::{
    ConflictChoice, ConflictRecord, ConflictResolver, ConflictStatus, EntityPolicy, FieldStrategy,
    MergePolicy, Resolution,
};
pub use retry::RetryPolicy;
pub use state::{LocalStateStore, SubscriptionId};
pub use storage::{DurableQueueStore, FileStore, KeyValueStore, MemoryStore, StorageError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
