//! Edits: the unit of change queued on the client and applied by the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::record::{EntityKind, Fields, Record, RecordId};

/// Kind of operation an edit performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Toggle,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Create => write!(f, "create"),
            OpKind::Update => write!(f, "update"),
            OpKind::Toggle => write!(f, "toggle"),
            OpKind::Delete => write!(f, "delete"),
        }
    }
}

/// An edit was rejected as malformed, locally or by the server.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{op} {record_id}: {message}")]
pub struct ValidationError {
    pub record_id: RecordId,
    pub op: OpKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(edit: &Edit, message: impl Into<String>) -> Self {
        Self {
            record_id: edit.record_id.clone(),
            op: edit.op,
            message: message.into(),
        }
    }
}

/// A single user change to one record.
///
/// Edits are immutable once created apart from `attempt_count` (bumped on
/// every transient failure) and `base_version` (moved forward when an
/// earlier edit of the same record is acknowledged).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    /// Idempotency key honoured by the server.
    pub edit_id: Uuid,
    pub record_id: RecordId,
    pub kind: EntityKind,
    pub op: OpKind,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Server version the client believed current when the edit was made.
    pub base_version: u64,
    #[serde(default)]
    pub attempt_count: u32,
    /// Set when the edit was produced by an automatic conflict merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_from: Option<Uuid>,
}

impl Edit {
    fn build(
        record_id: impl Into<RecordId>,
        kind: EntityKind,
        op: OpKind,
        payload: Value,
        base_version: u64,
    ) -> Self {
        Self {
            edit_id: Uuid::new_v4(),
            record_id: record_id.into(),
            kind,
            op,
            payload,
            created_at: Utc::now(),
            base_version,
            attempt_count: 0,
            merged_from: None,
        }
    }

    /// Creates a new record with the given fields.
    pub fn create(record_id: impl Into<RecordId>, kind: EntityKind, fields: Fields) -> Self {
        Self::build(record_id, kind, OpKind::Create, Value::Object(fields), 0)
    }

    /// Creates a record again over the tombstone left at `tombstone_version`.
    pub fn recreate(
        record_id: impl Into<RecordId>,
        kind: EntityKind,
        fields: Fields,
        tombstone_version: u64,
    ) -> Self {
        Self::build(
            record_id,
            kind,
            OpKind::Create,
            Value::Object(fields),
            tombstone_version,
        )
    }

    /// Overwrites the given fields; a `null` value removes the field.
    pub fn update(
        record_id: impl Into<RecordId>,
        kind: EntityKind,
        fields: Fields,
        base_version: u64,
    ) -> Self {
        Self::build(
            record_id,
            kind,
            OpKind::Update,
            Value::Object(fields),
            base_version,
        )
    }

    /// Sets a boolean field to `value` (the result of flipping it).
    pub fn toggle(
        record_id: impl Into<RecordId>,
        kind: EntityKind,
        field: &str,
        value: bool,
        base_version: u64,
    ) -> Self {
        Self::build(
            record_id,
            kind,
            OpKind::Toggle,
            json!({ "field": field, "value": value }),
            base_version,
        )
    }

    pub fn delete(record_id: impl Into<RecordId>, kind: EntityKind, base_version: u64) -> Self {
        Self::build(record_id, kind, OpKind::Delete, Value::Null, base_version)
    }

    /// Overrides the creation time (used for replayed or imported edits).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// The `(field, value)` pair of a toggle payload.
    pub fn toggle_target(&self) -> Option<(&str, bool)> {
        let field = self.payload.get("field")?.as_str()?;
        let value = self.payload.get("value")?.as_bool()?;
        Some((field, value))
    }

    /// Names of the fields this edit writes.
    pub fn touched_fields(&self) -> Vec<String> {
        match self.op {
            OpKind::Create | OpKind::Update => self
                .payload
                .as_object()
                .map(|fields| fields.keys().cloned().collect())
                .unwrap_or_default(),
            OpKind::Toggle => self
                .toggle_target()
                .map(|(field, _)| vec![field.to_string()])
                .unwrap_or_default(),
            OpKind::Delete => Vec::new(),
        }
    }

    /// Checks the payload shape for the edit's operation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.op {
            OpKind::Create => {
                if !self.payload.is_object() {
                    return Err(ValidationError::new(self, "payload must be an object"));
                }
            }
            OpKind::Update => match self.payload.as_object() {
                Some(fields) if !fields.is_empty() => {}
                Some(_) => return Err(ValidationError::new(self, "update has no fields")),
                None => return Err(ValidationError::new(self, "payload must be an object")),
            },
            OpKind::Toggle => {
                if self.toggle_target().is_none() {
                    return Err(ValidationError::new(
                        self,
                        "toggle payload must be {\"field\": string, \"value\": bool}",
                    ));
                }
            }
            OpKind::Delete => {}
        }
        Ok(())
    }

    /// Checks the edit against the record it will be applied to.
    pub fn validate_against(&self, current: Option<&Record>) -> Result<(), ValidationError> {
        self.validate()?;
        let live = current.and_then(Record::live);
        match (self.op, live) {
            (OpKind::Create, Some(_)) => {
                Err(ValidationError::new(self, "record already exists"))
            }
            (OpKind::Create, None) => {
                let tombstone_version = current.map(|r| r.version).unwrap_or(0);
                if self.base_version == tombstone_version {
                    Ok(())
                } else if tombstone_version == 0 {
                    Err(ValidationError::new(
                        self,
                        "create must not carry a base version",
                    ))
                } else {
                    Err(ValidationError::new(
                        self,
                        format!("create must build on deleted version {}", tombstone_version),
                    ))
                }
            }
            (OpKind::Update | OpKind::Toggle | OpKind::Delete, None) => {
                Err(ValidationError::new(self, "record does not exist"))
            }
            (OpKind::Toggle, Some(record)) => {
                let (field, _) = self.toggle_target().unwrap_or_default();
                match record.field(field) {
                    None | Some(Value::Bool(_)) => Ok(()),
                    Some(_) => Err(ValidationError::new(
                        self,
                        format!("field '{}' is not a flag", field),
                    )),
                }
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (base v{}, {} attempt(s))",
            self.edit_id, self.op, self.record_id, self.base_version, self.attempt_count
        )
    }
}
