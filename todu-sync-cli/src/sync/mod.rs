//! Glue between the CLI and the sync core.
//!
//! Every invocation opens a [`SyncCoordinator`] over the file-backed queue in
//! the data directory. The coordinator starts offline; only [`push`] brings
//! it online, after the server answered its health check.

pub mod auto_sync;
pub mod report;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use todu_sync_core::{
    check_server, Applied, ApplyError, Backend, Edit, FileStore, HttpBackend, KeyValueStore,
    SyncCoordinator, SyncError, SyncOptions, SyncSession, SystemClock,
};

use crate::config::{Config, SyncConfig};

pub use auto_sync::try_auto_sync;

/// Upper bound for one explicit `fit-sync sync`.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend used while no server is configured. Edits stay queued.
pub struct Unconfigured;

#[async_trait]
impl Backend for Unconfigured {
    async fn apply(&self, _edit: &Edit) -> Result<Applied, ApplyError> {
        Err(ApplyError::Transient(
            "sync server not configured".to_string(),
        ))
    }
}

pub fn http_backend(sync: &SyncConfig) -> Option<HttpBackend> {
    match (&sync.server_url, &sync.api_key) {
        (Some(url), Some(key)) => Some(HttpBackend::new(url.clone(), key.clone())),
        _ => None,
    }
}

pub fn open_coordinator(config: &Config) -> Result<SyncCoordinator, SyncError> {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.queue_dir()));
    let backend: Arc<dyn Backend> = match http_backend(&config.sync) {
        Some(backend) => Arc::new(backend),
        None => Arc::new(Unconfigured),
    };
    let options = SyncOptions {
        start_online: false,
        ..SyncOptions::default()
    };
    SyncCoordinator::open(store, backend, Arc::new(SystemClock), options)
}

#[derive(Debug)]
pub enum SyncOutcome {
    Unreachable,
    Settled(SyncSession),
    /// Still backing off when the time limit ran out.
    TimedOut,
}

/// Sends queued edits if the server is reachable.
pub async fn push(
    coordinator: &SyncCoordinator,
    server_url: &str,
    limit: Duration,
) -> Result<SyncOutcome, SyncError> {
    if !check_server(server_url).await {
        coordinator.set_online(false);
        return Ok(SyncOutcome::Unreachable);
    }

    coordinator.set_online(true);
    match tokio::time::timeout(limit, coordinator.drain_until_settled()).await {
        Ok(result) => result.map(SyncOutcome::Settled),
        Err(_) => {
            tracing::warn!(limit = ?limit, "sync did not settle in time");
            Ok(SyncOutcome::TimedOut)
        }
    }
}

/// Re-fetches every known record without pending edits and installs newer
/// server copies. Returns how many records changed.
pub async fn pull(coordinator: &SyncCoordinator, backend: &HttpBackend) -> Result<usize, SyncError> {
    let mut updated = 0;
    for snapshot in coordinator.state().server_snapshots() {
        if coordinator.queue().has_pending(&snapshot.record_id) {
            continue;
        }
        match backend.fetch(&snapshot.record_id).await {
            Ok(Some(record)) if record.version > snapshot.version => {
                if coordinator.refresh(record)? {
                    updated += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(record_id = %snapshot.record_id, error = %e, "refresh failed");
                break;
            }
        }
    }
    Ok(updated)
}
