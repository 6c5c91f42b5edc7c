//! The backend collaborator the coordinator drains edits into.

mod http;
mod memory;
pub mod protocol;

pub use http::{check_server, HttpBackend};
pub use memory::{BackendState, MemoryBackend};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Edit, Record};

/// A successfully applied edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applied {
    pub record: Record,
    pub new_version: u64,
}

impl Applied {
    pub fn new(record: Record) -> Self {
        let new_version = record.version;
        Self {
            record,
            new_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RejectReason {
    Validation(String),
    VersionConflict,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Validation(msg) => write!(f, "validation failed: {}", msg),
            RejectReason::VersionConflict => write!(f, "version conflict"),
        }
    }
}

/// A permanent refusal, with the server's current record when it has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub current: Option<Record>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    /// Network failure, timeout or overloaded server; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rejected: {}", .0.reason)]
    Rejected(Rejection),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }
}

/// Applies edits on the authoritative side.
///
/// Implementations must be idempotent by `edit_id`: re-applying an edit
/// that already succeeded returns the original result without applying it
/// twice.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn apply(&self, edit: &Edit) -> Result<Applied, ApplyError>;
}
