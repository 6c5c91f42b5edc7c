//! Folding pending edits onto a server snapshot.
//!
//! The visible state of a record is always
//! `fold(server_snapshot, pending_edits_in_creation_order)`.

use serde_json::Value;

use super::edit::{Edit, OpKind};
use super::record::Record;

/// Applies a single edit to the current state of a record.
///
/// Edits that do not fit the current state (create over a live record,
/// update of a missing record) leave the state unchanged; such edits are
/// rejected before they are queued, so this only happens while replaying
/// over a snapshot that moved underneath them.
pub fn apply_edit(current: Option<Record>, edit: &Edit) -> Option<Record> {
    match edit.op {
        OpKind::Create => match current {
            Some(record) if !record.deleted => Some(record),
            previous => {
                let fields = edit.payload.as_object().cloned().unwrap_or_default();
                Some(Record {
                    record_id: edit.record_id.clone(),
                    kind: edit.kind,
                    version: previous.map(|r| r.version).unwrap_or(0),
                    fields,
                    deleted: false,
                    updated_at: edit.created_at,
                })
            }
        },
        OpKind::Update => current.map(|mut record| {
            if record.deleted {
                return record;
            }
            if let Some(changes) = edit.payload.as_object() {
                for (key, value) in changes {
                    if value.is_null() {
                        record.fields.remove(key);
                    } else {
                        record.fields.insert(key.clone(), value.clone());
                    }
                }
                record.updated_at = edit.created_at;
            }
            record
        }),
        OpKind::Toggle => current.map(|mut record| {
            if record.deleted {
                return record;
            }
            if let Some((field, value)) = edit.toggle_target() {
                record.fields.insert(field.to_string(), Value::Bool(value));
                record.updated_at = edit.created_at;
            }
            record
        }),
        OpKind::Delete => current.map(|mut record| {
            record.deleted = true;
            record.updated_at = edit.created_at;
            record
        }),
    }
}

/// Folds `edits` in order onto `base`.
///
/// Tombstones are returned as records with `deleted` set; callers that
/// present state to users filter them out.
pub fn fold(base: Option<&Record>, edits: &[Edit]) -> Option<Record> {
    edits
        .iter()
        .fold(base.cloned(), |state, edit| apply_edit(state, edit))
}
