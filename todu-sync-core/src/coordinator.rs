//! The sync state machine.
//!
//! ```text
//! Idle --enqueue--> Draining --queue empty--> Idle
//! Draining --transient failure--> Backoff --timer--> Draining
//! any --became-offline--> Offline --became-online--> Draining | Idle
//! ```
//!
//! User actions (`submit` and friends) persist the edit, apply it
//! optimistically and wake the drain loop. Draining sends the head edit of
//! up to `max_in_flight` records concurrently; edits of one record are
//! sent strictly one after another.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use uuid::Uuid;

use crate::backend::{Applied, ApplyError, Backend, RejectReason, Rejection};
use crate::clock::Clock;
use crate::connectivity::ConnectivityEvent;
use crate::error::SyncError;
use crate::model::{Edit, EntityKind, Fields, OpKind, Record, RecordId, ValidationError};
use crate::queue::ChangeQueue;
use crate::resolver::{ConflictChoice, ConflictRecord, ConflictResolver, MergePolicy, Resolution};
use crate::retry::RetryPolicy;
use crate::state::LocalStateStore;
use crate::storage::{DurableQueueStore, KeyValueStore, StorageError};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Draining,
    Backoff,
    Offline,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Draining => write!(f, "draining"),
            Phase::Backoff => write!(f, "backoff"),
            Phase::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub phase: Phase,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Delay of the current (or last) backoff.
    pub retry_delay: Option<Duration>,
}

/// What the user should see for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    /// Saved locally, syncing.
    SavedLocally,
    /// A manual conflict or an edit that ran out of retries.
    NeedsAttention,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::SavedLocally => write!(f, "saved locally, syncing"),
            SyncStatus::NeedsAttention => write!(f, "needs attention"),
        }
    }
}

/// Notifications for UI layers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged { from: Phase, to: Phase },
    Acknowledged { edit_id: Uuid, record: Record },
    ValidationFailed(ValidationError),
    AutoMerged(ConflictRecord),
    ConflictDetected(ConflictRecord),
    /// A local change was thrown away in favour of the server state.
    Discarded {
        record_id: RecordId,
        edit_id: Uuid,
        notice: String,
    },
    RetriesExhausted { edit: Edit, error: String },
    ConflictResolved {
        conflict_id: Uuid,
        choice: ConflictChoice,
    },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub retry: RetryPolicy,
    /// Records sent concurrently per batch.
    pub max_in_flight: usize,
    pub merge_policy: MergePolicy,
    pub start_online: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_in_flight: 4,
            merge_policy: MergePolicy::default(),
            start_online: true,
        }
    }
}

/// Counts from one [`SyncCoordinator::drain_once`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub acknowledged: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub transient: usize,
}

pub struct SyncCoordinator {
    queue: ChangeQueue,
    state: LocalStateStore,
    backend: Arc<dyn Backend>,
    resolver: ConflictResolver,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    session: Mutex<SyncSession>,
    online: AtomicBool,
    conflicts: Mutex<Vec<ConflictRecord>>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

impl SyncCoordinator {
    /// Rehydrates queue, snapshots and conflicts from `store`.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let durable = DurableQueueStore::new(store);
        let snapshots = durable.load_snapshots()?;
        let conflicts = durable.load_conflicts()?;
        let queue = ChangeQueue::rehydrate(durable)?;

        let state = LocalStateStore::new();
        state.hydrate(snapshots, &queue.snapshot());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let online = options.start_online;

        let coordinator = Self {
            queue,
            state,
            backend,
            resolver: ConflictResolver::new(options.merge_policy.clone()),
            clock,
            options,
            session: Mutex::new(SyncSession {
                phase: Phase::Idle,
                last_synced_at: None,
                last_error: None,
                retry_delay: None,
            }),
            online: AtomicBool::new(online),
            conflicts: Mutex::new(conflicts),
            events,
            wake: Notify::new(),
        };

        let phase = if !online {
            Phase::Offline
        } else if coordinator.has_ready_work() {
            Phase::Draining
        } else {
            Phase::Idle
        };
        coordinator.session.lock().phase = phase;

        tracing::info!(
            pending = coordinator.queue.len(),
            conflicts = coordinator.conflicts.lock().len(),
            %phase,
            "sync coordinator opened"
        );
        Ok(coordinator)
    }

    pub fn state(&self) -> &LocalStateStore {
        &self.state
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn session(&self) -> SyncSession {
        self.session.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.session.lock().phase
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ---- user actions ----

    /// Validates, persists and optimistically applies an edit.
    ///
    /// Nothing is applied if the edit cannot be persisted.
    pub fn submit(&self, edit: Edit) -> Result<Edit, SyncError> {
        let current = self.state.visible_or_tombstone(&edit.record_id);
        edit.validate_against(current.as_ref())?;

        self.queue.enqueue(edit.clone())?;
        self.state.apply_optimistic(edit.clone());
        tracing::debug!(edit_id = %edit.edit_id, record_id = %edit.record_id, op = %edit.op, "edit queued");

        self.kick();
        Ok(edit)
    }

    pub fn create(
        &self,
        record_id: impl Into<RecordId>,
        kind: EntityKind,
        fields: Fields,
    ) -> Result<Edit, SyncError> {
        let record_id = record_id.into();
        let base = self.state.server_version(&record_id);
        let edit = Edit::recreate(record_id, kind, fields, base);
        self.submit(edit.with_created_at(self.clock.now()))
    }

    pub fn update(&self, record_id: impl Into<RecordId>, fields: Fields) -> Result<Edit, SyncError> {
        let record = self.visible_record(record_id.into())?;
        let base = self.state.server_version(&record.record_id);
        let edit = Edit::update(record.record_id, record.kind, fields, base);
        self.submit(edit.with_created_at(self.clock.now()))
    }

    /// Flips a boolean field of the visible record (missing counts as false).
    pub fn toggle(&self, record_id: impl Into<RecordId>, field: &str) -> Result<Edit, SyncError> {
        let record = self.visible_record(record_id.into())?;
        let value = !record.bool_field(field).unwrap_or(false);
        let base = self.state.server_version(&record.record_id);
        let edit = Edit::toggle(record.record_id, record.kind, field, value, base);
        self.submit(edit.with_created_at(self.clock.now()))
    }

    pub fn delete(&self, record_id: impl Into<RecordId>) -> Result<Edit, SyncError> {
        let record = self.visible_record(record_id.into())?;
        let base = self.state.server_version(&record.record_id);
        let edit = Edit::delete(record.record_id, record.kind, base);
        self.submit(edit.with_created_at(self.clock.now()))
    }

    fn visible_record(&self, record_id: RecordId) -> Result<Record, SyncError> {
        self.state
            .get_visible_state(&record_id)
            .ok_or(SyncError::UnknownRecord(record_id))
    }

    /// Cancels a pending edit before it syncs.
    pub fn discard(&self, edit_id: Uuid) -> Result<Edit, SyncError> {
        let edit = self
            .queue
            .discard(edit_id)?
            .ok_or(SyncError::UnknownEdit(edit_id))?;
        self.state.remove_pending(&edit.record_id, edit_id);

        let stale: Vec<Uuid> = self
            .conflicts
            .lock()
            .iter()
            .filter(|c| c.local_edit.edit_id == edit_id)
            .map(|c| c.conflict_id)
            .collect();
        for conflict_id in stale {
            self.remove_conflict(conflict_id)?;
        }

        self.kick();
        Ok(edit)
    }

    /// Gives a stalled edit a fresh set of attempts.
    pub fn force_retry(&self, edit_id: Uuid) -> Result<Edit, SyncError> {
        let edit = self
            .queue
            .reset_attempts(edit_id)?
            .ok_or(SyncError::UnknownEdit(edit_id))?;
        tracing::info!(edit_id = %edit_id, "forcing retry");
        self.kick();
        Ok(edit)
    }

    /// Conflicts waiting for the user.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().clone()
    }

    pub fn resolve(&self, conflict_id: Uuid, choice: ConflictChoice) -> Result<(), SyncError> {
        let conflict = self
            .conflicts
            .lock()
            .iter()
            .find(|c| c.conflict_id == conflict_id)
            .cloned()
            .ok_or(SyncError::UnknownConflict(conflict_id))?;
        let edit_id = conflict.local_edit.edit_id;
        let server = conflict.server_record.as_ref().filter(|r| !r.deleted);

        match (choice, self.queue.get(edit_id)) {
            (_, None) => {}
            (ConflictChoice::KeepTheirs, Some(edit)) => {
                self.queue.remove(edit_id)?;
                self.state.remove_pending(&edit.record_id, edit_id);
                if let Some(server) = server {
                    self.queue
                        .rebase(&edit.record_id, edit.base_version, server.version)?;
                }
            }
            (ConflictChoice::KeepMine, Some(edit)) => {
                let Some(server) = server else {
                    return Err(SyncError::Unresolvable(format!(
                        "{} was deleted on the server",
                        edit.record_id
                    )));
                };
                self.keep_mine(edit, server)?;
            }
        }

        self.remove_conflict(conflict_id)?;
        tracing::info!(conflict_id = %conflict_id, ?choice, "conflict resolved");
        self.emit(SyncEvent::ConflictResolved {
            conflict_id,
            choice,
        });
        self.kick();
        Ok(())
    }

    fn keep_mine(&self, edit: Edit, server: &Record) -> Result<(), SyncError> {
        if edit.op == OpKind::Create {
            // The record exists now, so the create becomes an update of it.
            let mut replacement = edit.clone();
            replacement.op = OpKind::Update;
            replacement.base_version = server.version;
            replacement.attempt_count = 0;
            self.queue.replace(edit.edit_id, replacement.clone())?;
            self.state.replace_pending(edit.edit_id, replacement);
        } else {
            self.queue.reset_attempts(edit.edit_id)?;
        }
        self.queue
            .rebase(&edit.record_id, edit.base_version, server.version)?;
        Ok(())
    }

    /// Installs a record fetched from the server as the new base snapshot.
    pub fn refresh(&self, record: Record) -> Result<bool, SyncError> {
        self.persist_snapshot(&record)?;
        Ok(self.state.apply_server_snapshot(record))
    }

    pub fn record_status(&self, record_id: &RecordId) -> SyncStatus {
        let conflicted = self
            .conflicts
            .lock()
            .iter()
            .any(|c| &c.record_id == record_id);
        let pending = self.queue.pending_for(record_id);
        let stalled = pending
            .first()
            .is_some_and(|e| self.options.retry.exhausted(e.attempt_count));

        if conflicted || stalled {
            SyncStatus::NeedsAttention
        } else if !pending.is_empty() {
            SyncStatus::SavedLocally
        } else {
            SyncStatus::Synced
        }
    }

    // ---- connectivity ----

    pub fn handle_connectivity(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::BecameOffline => {
                self.online.store(false, Ordering::SeqCst);
                self.set_phase(Phase::Offline);
            }
            ConnectivityEvent::BecameOnline => {
                self.online.store(true, Ordering::SeqCst);
                let next = if self.has_ready_work() {
                    Phase::Draining
                } else {
                    Phase::Idle
                };
                self.set_phase(next);
                self.wake.notify_one();
            }
        }
    }

    pub fn set_online(&self, online: bool) {
        self.handle_connectivity(if online {
            ConnectivityEvent::BecameOnline
        } else {
            ConnectivityEvent::BecameOffline
        });
    }

    // ---- draining ----

    /// Sends one batch of head edits and handles every outcome.
    pub async fn drain_once(&self) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        if !self.is_online() {
            self.set_phase(Phase::Offline);
            return Ok(report);
        }

        let heads = self.queue.ready_heads(
            self.options.max_in_flight.max(1),
            &self.blocked_edits(),
            self.options.retry.max_attempts,
        );
        if heads.is_empty() {
            self.set_phase(Phase::Idle);
            return Ok(report);
        }

        self.set_phase(Phase::Draining);
        report.sent = heads.len();
        tracing::debug!(batch = heads.len(), "draining");

        let results = join_all(heads.iter().map(|edit| self.backend.apply(edit))).await;

        let mut retry_after: Option<u32> = None;
        for (edit, result) in heads.into_iter().zip(results) {
            match result {
                Ok(applied) => {
                    self.handle_applied(edit, applied)?;
                    report.acknowledged += 1;
                }
                Err(ApplyError::Transient(message)) => {
                    report.transient += 1;
                    if let Some(attempts) = self.handle_transient(edit, message)? {
                        retry_after = Some(retry_after.map_or(attempts, |n| n.max(attempts)));
                    }
                }
                Err(ApplyError::Rejected(Rejection {
                    reason: RejectReason::Validation(message),
                    ..
                })) => {
                    self.handle_invalid(edit, message)?;
                    report.rejected += 1;
                }
                Err(ApplyError::Rejected(Rejection {
                    reason: RejectReason::VersionConflict,
                    current,
                })) => {
                    self.handle_conflict(edit, current)?;
                    report.conflicts += 1;
                }
            }
        }

        if let Some(attempts) = retry_after {
            let delay = self.options.retry.delay_for(attempts);
            self.enter_backoff(delay);
        }
        Ok(report)
    }

    /// Drains until nothing sendable is left or the client goes offline,
    /// sleeping out backoffs on the clock.
    pub async fn drain_until_settled(&self) -> Result<SyncSession, SyncError> {
        loop {
            self.drain_once().await?;
            match self.phase() {
                Phase::Idle | Phase::Offline => return Ok(self.session()),
                Phase::Backoff => {
                    let delay = self.backoff_delay();
                    self.clock.sleep(delay).await;
                    self.leave_backoff();
                }
                Phase::Draining => {}
            }
        }
    }

    /// Event loop: reacts to connectivity changes, new edits and backoff
    /// timers until the connectivity channel closes.
    pub async fn run(&self, mut connectivity: mpsc::Receiver<ConnectivityEvent>) {
        tracing::info!("sync loop started");
        loop {
            let phase = self.phase();
            let delay = self.backoff_delay();

            tokio::select! {
                event = connectivity.recv() => match event {
                    Some(event) => self.handle_connectivity(event),
                    None => {
                        tracing::info!("connectivity channel closed, sync loop stopping");
                        return;
                    }
                },
                _ = self.wake.notified(), if phase == Phase::Idle => {
                    if self.is_online() && self.has_ready_work() {
                        self.set_phase(Phase::Draining);
                    }
                }
                _ = self.clock.sleep(delay), if phase == Phase::Backoff => self.leave_backoff(),
                result = self.drain_once(), if phase == Phase::Draining => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "drain failed");
                        self.session.lock().last_error = Some(e.to_string());
                        self.enter_backoff(self.options.retry.max_delay);
                    }
                }
            }
        }
    }

    fn handle_applied(&self, edit: Edit, applied: Applied) -> Result<(), SyncError> {
        self.persist_snapshot(&applied.record)?;
        self.state.acknowledge(edit.edit_id, applied.record.clone());
        self.queue.remove(edit.edit_id)?;
        self.queue
            .rebase(&edit.record_id, edit.base_version, applied.new_version)?;

        {
            let mut session = self.session.lock();
            session.last_synced_at = Some(self.clock.now());
            session.last_error = None;
        }
        tracing::debug!(
            edit_id = %edit.edit_id,
            record_id = %edit.record_id,
            version = applied.new_version,
            "edit acknowledged"
        );
        self.emit(SyncEvent::Acknowledged {
            edit_id: edit.edit_id,
            record: applied.record,
        });
        Ok(())
    }

    /// Returns the attempt count to back off for, or `None` if the edit is
    /// gone or out of retries.
    fn handle_transient(&self, edit: Edit, message: String) -> Result<Option<u32>, SyncError> {
        if self.queue.get(edit.edit_id).is_none() {
            return Ok(None);
        }
        let requeued = self.queue.requeue_front(edit)?;
        self.session.lock().last_error = Some(message.clone());

        if self.options.retry.exhausted(requeued.attempt_count) {
            tracing::warn!(
                edit_id = %requeued.edit_id,
                attempts = requeued.attempt_count,
                error = %message,
                "giving up on edit until retried"
            );
            self.emit(SyncEvent::RetriesExhausted {
                edit: requeued,
                error: message,
            });
            return Ok(None);
        }

        tracing::debug!(
            edit_id = %requeued.edit_id,
            attempt = requeued.attempt_count,
            error = %message,
            "transient failure"
        );
        Ok(Some(requeued.attempt_count))
    }

    fn handle_invalid(&self, edit: Edit, message: String) -> Result<(), SyncError> {
        self.queue.remove(edit.edit_id)?;
        self.state.remove_pending(&edit.record_id, edit.edit_id);

        let error = ValidationError::new(&edit, message);
        tracing::warn!(edit_id = %edit.edit_id, %error, "edit rejected");
        self.session.lock().last_error = Some(error.to_string());
        self.emit(SyncEvent::ValidationFailed(error));
        Ok(())
    }

    /// Resolves the rejected edit and the record's later edits built on
    /// the same stale base, stopping at the first one that needs the user.
    fn handle_conflict(&self, edit: Edit, current: Option<Record>) -> Result<(), SyncError> {
        let base = self.state.server_snapshot(&edit.record_id);
        let followers: Vec<Edit> = self
            .queue
            .pending_for(&edit.record_id)
            .into_iter()
            .filter(|e| e.edit_id != edit.edit_id && e.base_version == edit.base_version)
            .collect();

        if let Some(server) = &current {
            self.refresh(server.clone())?;
        }

        for candidate in std::iter::once(edit).chain(followers) {
            match self
                .resolver
                .resolve(&candidate, current.as_ref(), base.as_ref())
                .with_detected_at(self.clock.now())
            {
                Resolution::Resubmit { edit: merged, conflict } => {
                    tracing::info!(
                        edit_id = %candidate.edit_id,
                        merged_id = %merged.edit_id,
                        reason = %conflict.reason,
                        "conflict auto-merged"
                    );
                    let recreated = merged.op == OpKind::Create;
                    let (stale_base, new_base) = (candidate.base_version, merged.base_version);
                    self.queue.replace(candidate.edit_id, merged.clone())?;
                    self.state.replace_pending(candidate.edit_id, merged);
                    self.emit(SyncEvent::AutoMerged(conflict));
                    if recreated {
                        // Later edits build on the re-created record.
                        self.queue
                            .rebase(&candidate.record_id, stale_base, new_base)?;
                        break;
                    }
                }
                Resolution::Drop { conflict, notice } => {
                    tracing::info!(
                        edit_id = %candidate.edit_id,
                        reason = %conflict.reason,
                        "conflicted edit dropped"
                    );
                    self.queue.remove(candidate.edit_id)?;
                    self.state
                        .remove_pending(&candidate.record_id, candidate.edit_id);
                    self.emit(SyncEvent::AutoMerged(conflict));
                    if let Some(notice) = notice {
                        self.emit(SyncEvent::Discarded {
                            record_id: candidate.record_id.clone(),
                            edit_id: candidate.edit_id,
                            notice,
                        });
                    }
                }
                Resolution::Manual(conflict) => {
                    tracing::warn!(
                        edit_id = %candidate.edit_id,
                        record_id = %candidate.record_id,
                        reason = %conflict.reason,
                        "conflict needs attention"
                    );
                    let mut conflicts = self.conflicts();
                    conflicts.push(conflict.clone());
                    self.queue.store().save_conflicts(&conflicts)?;
                    *self.conflicts.lock() = conflicts;
                    self.emit(SyncEvent::ConflictDetected(conflict));
                    break;
                }
            }
        }
        Ok(())
    }

    // ---- helpers ----

    fn remove_conflict(&self, conflict_id: Uuid) -> Result<(), StorageError> {
        let mut conflicts = self.conflicts();
        conflicts.retain(|c| c.conflict_id != conflict_id);
        self.queue.store().save_conflicts(&conflicts)?;
        *self.conflicts.lock() = conflicts;
        Ok(())
    }

    /// Persists `record` as the record's snapshot unless a newer one is held.
    fn persist_snapshot(&self, record: &Record) -> Result<(), StorageError> {
        let mut snapshots = self.state.server_snapshots();
        match snapshots
            .iter_mut()
            .find(|s| s.record_id == record.record_id)
        {
            Some(existing) if existing.version > record.version => return Ok(()),
            Some(existing) => *existing = record.clone(),
            None => snapshots.push(record.clone()),
        }
        self.queue.store().save_snapshots(&snapshots)
    }

    fn blocked_edits(&self) -> HashSet<Uuid> {
        self.conflicts
            .lock()
            .iter()
            .map(|c| c.local_edit.edit_id)
            .collect()
    }

    fn has_ready_work(&self) -> bool {
        !self
            .queue
            .ready_heads(1, &self.blocked_edits(), self.options.retry.max_attempts)
            .is_empty()
    }

    /// Moves `Idle` to `Draining` after new work appeared.
    fn kick(&self) {
        if self.is_online() && self.phase() == Phase::Idle && self.has_ready_work() {
            self.set_phase(Phase::Draining);
        }
        self.wake.notify_one();
    }

    fn backoff_delay(&self) -> Duration {
        self.session
            .lock()
            .retry_delay
            .unwrap_or(self.options.retry.base_delay)
    }

    fn enter_backoff(&self, delay: Duration) {
        self.session.lock().retry_delay = Some(delay);
        tracing::info!(delay_ms = delay.as_millis() as u64, "backing off");
        self.set_phase(Phase::Backoff);
    }

    fn leave_backoff(&self) {
        if self.phase() == Phase::Backoff {
            self.set_phase(Phase::Draining);
        }
    }

    fn set_phase(&self, to: Phase) {
        let from = {
            let mut session = self.session.lock();
            let from = session.phase;
            if from == to {
                return;
            }
            session.phase = to;
            from
        };
        tracing::debug!(%from, %to, "sync phase changed");
        self.emit(SyncEvent::PhaseChanged { from, to });
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
