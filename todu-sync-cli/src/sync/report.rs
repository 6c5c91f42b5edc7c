//! Human-readable lines for sync events.

use tokio::sync::broadcast::{self, error::TryRecvError};
use todu_sync_core::{ConflictChoice, SyncEvent};

/// Drains whatever the coordinator has broadcast so far.
pub fn collect(receiver: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "sync events dropped");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    events
}

pub fn describe(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::PhaseChanged { .. } => None,
        SyncEvent::Acknowledged { record, .. } => Some(format!(
            "✓ synced {} (v{})",
            record.record_id, record.version
        )),
        SyncEvent::ValidationFailed(error) => Some(format!(
            "✗ rejected {} of {}: {}",
            error.op, error.record_id, error.message
        )),
        SyncEvent::AutoMerged(conflict) => Some(format!(
            "↻ merged {}: {}",
            conflict.record_id, conflict.reason
        )),
        SyncEvent::ConflictDetected(conflict) => Some(format!(
            "! conflict on {} ({}): {}",
            conflict.record_id, conflict.conflict_id, conflict.reason
        )),
        SyncEvent::Discarded {
            record_id, notice, ..
        } => Some(format!("✗ dropped change to {}: {}", record_id, notice)),
        SyncEvent::RetriesExhausted { edit, error } => Some(format!(
            "! gave up on {} of {} after {} attempts: {}",
            edit.op, edit.record_id, edit.attempt_count, error
        )),
        SyncEvent::ConflictResolved {
            conflict_id,
            choice,
        } => Some(format!(
            "✓ resolved {} ({})",
            conflict_id,
            choice_label(*choice)
        )),
    }
}

pub fn choice_label(choice: ConflictChoice) -> &'static str {
    match choice {
        ConflictChoice::KeepMine => "kept mine",
        ConflictChoice::KeepTheirs => "kept theirs",
    }
}

pub fn print_events(events: &[SyncEvent]) {
    for line in events.iter().filter_map(describe) {
        println!("  {}", line);
    }
}
