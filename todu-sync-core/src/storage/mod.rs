//! Durable local storage for the pending edit queue.
//!
//! The queue is persisted through a small key-value interface so that the
//! backing store can be swapped per platform:
//! - [`MemoryStore`]: in-process map, used by tests and ephemeral sessions
//! - [`FileStore`]: one file per key in the data directory
//!
//! [`DurableQueueStore`] layers the queue, server snapshots and pending
//! conflicts on top of any [`KeyValueStore`].

mod file;
mod memory;
mod queue_store;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use queue_store::DurableQueueStore;

/// Failure of the durable store. Fatal for the edit being persisted.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error for {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] io::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Failed to encode '{0}': {1}")]
    Encode(String, String),

    #[error("Failed to decode '{0}': {1}")]
    Decode(String, String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal key-value interface used to persist sync state.
///
/// Calls are synchronous: a write has reached the store once `set` returns.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}
