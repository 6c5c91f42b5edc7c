//! Conflict resolution for edits rejected because their base version was
//! stale.
//!
//! Automatic merges are only attempted where a strategy has been declared
//! for the entity type and field:
//! - `LastWriteWins`: the newer of the local edit (`created_at`) and the
//!   server write (`updated_at`) wins; ties go to the server
//! - `Union`: array fields keep every element from both sides
//! - `delete_wins`: a local change racing a server delete is discarded with
//!   a notice
//!
//! A create over a server tombstone is rebased onto the tombstone.
//!
//! Anything else, and every local delete of a record the server still has,
//! becomes a `ManualPending` conflict for the user to decide.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{Edit, EntityKind, OpKind, Record, RecordId};

/// How a field may be merged automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStrategy {
    LastWriteWins,
    Union,
}

/// Declared merge behaviour for one entity type.
#[derive(Debug, Clone, Default)]
pub struct EntityPolicy {
    fields: HashMap<String, FieldStrategy>,
    delete_wins: bool,
}

impl EntityPolicy {
    pub fn field(mut self, name: &str, strategy: FieldStrategy) -> Self {
        self.fields.insert(name.to_string(), strategy);
        self
    }

    pub fn delete_wins(mut self, enabled: bool) -> Self {
        self.delete_wins = enabled;
        self
    }

    pub fn strategy(&self, field: &str) -> Option<FieldStrategy> {
        self.fields.get(field).copied()
    }
}

/// Merge strategies per entity type.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    entities: HashMap<EntityKind, EntityPolicy>,
}

impl MergePolicy {
    /// A policy with no automatic merges at all.
    pub fn manual_only() -> Self {
        Self {
            entities: HashMap::new(),
        }
    }

    pub fn with_entity(mut self, kind: EntityKind, policy: EntityPolicy) -> Self {
        self.entities.insert(kind, policy);
        self
    }

    pub fn entity(&self, kind: EntityKind) -> Option<&EntityPolicy> {
        self.entities.get(&kind)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        use FieldStrategy::*;

        Self::manual_only()
            .with_entity(
                EntityKind::GroceryItem,
                EntityPolicy::default()
                    .field("checked", LastWriteWins)
                    .delete_wins(true),
            )
            .with_entity(
                EntityKind::GroceryList,
                EntityPolicy::default().field("items", Union).delete_wins(true),
            )
            .with_entity(
                EntityKind::MealPlan,
                EntityPolicy::default()
                    .field("dish_ids", Union)
                    .field("ingredients", Union)
                    .delete_wins(true),
            )
            .with_entity(
                EntityKind::Notification,
                EntityPolicy::default()
                    .field("acknowledged", LastWriteWins)
                    .field("status", LastWriteWins)
                    .delete_wins(true),
            )
    }
}

/// Outcome recorded on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    AutoMerged,
    ManualPending,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStatus::AutoMerged => write!(f, "auto-merged"),
            ConflictStatus::ManualPending => write!(f, "needs attention"),
        }
    }
}

/// A rejected edit together with the server state it collided with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: Uuid,
    pub record_id: RecordId,
    pub local_edit: Edit,
    /// Current server record; `None` if the server returned none.
    pub server_record: Option<Record>,
    pub resolution: ConflictStatus,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    fn new(
        edit: &Edit,
        server: Option<&Record>,
        resolution: ConflictStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            record_id: edit.record_id.clone(),
            local_edit: edit.clone(),
            server_record: server.cloned(),
            resolution,
            reason: reason.into(),
            detected_at: Utc::now(),
        }
    }
}

/// What to do with a conflicted edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Submit `edit` (rebased on the server version) in place of the
    /// original.
    Resubmit { edit: Edit, conflict: ConflictRecord },
    /// Drop the edit; the server state stands. `notice` is set when the
    /// user lost a change and should be told.
    Drop {
        conflict: ConflictRecord,
        notice: Option<String>,
    },
    /// Leave the decision to the user.
    Manual(ConflictRecord),
}

impl Resolution {
    /// Stamps the conflict with the caller's clock.
    pub fn with_detected_at(mut self, detected_at: DateTime<Utc>) -> Self {
        match &mut self {
            Resolution::Resubmit { conflict, .. } | Resolution::Drop { conflict, .. } => {
                conflict.detected_at = detected_at
            }
            Resolution::Manual(conflict) => conflict.detected_at = detected_at,
        }
        self
    }
}

/// The user's answer to a manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Re-apply the local edit on top of the server record.
    KeepMine,
    /// Discard the local edit.
    KeepTheirs,
}

impl std::str::FromStr for ConflictChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mine" | "keep-mine" | "local" => Ok(ConflictChoice::KeepMine),
            "theirs" | "keep-theirs" | "server" => Ok(ConflictChoice::KeepTheirs),
            other => Err(format!("unknown choice: {} (use mine or theirs)", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: MergePolicy,
}

impl ConflictResolver {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Resolves a version conflict.
    ///
    /// `base` is the client's last known server snapshot, used to tell
    /// which fields the server changed since the edit was made.
    pub fn resolve(&self, edit: &Edit, server: Option<&Record>, base: Option<&Record>) -> Resolution {
        let manual = |reason: &str| {
            Resolution::Manual(ConflictRecord::new(
                edit,
                server,
                ConflictStatus::ManualPending,
                reason,
            ))
        };

        if edit.merged_from.is_some() {
            return manual("automatic merge was rejected again");
        }

        let Some(server_record) = server else {
            return manual("server did not return the current record");
        };
        let entity = self.policy.entity(edit.kind);

        if server_record.deleted {
            if edit.op == OpKind::Create {
                return self.resubmit(
                    edit,
                    server_record,
                    edit.payload.clone(),
                    "record created again after it was deleted",
                );
            }
            if edit.op == OpKind::Delete {
                return Resolution::Drop {
                    conflict: ConflictRecord::new(
                        edit,
                        server,
                        ConflictStatus::AutoMerged,
                        "record was already deleted",
                    ),
                    notice: None,
                };
            }
            if entity.is_some_and(|p| p.delete_wins) {
                let notice = format!(
                    "Your {} of {} was discarded because the record was deleted on another device",
                    edit.op, edit.record_id
                );
                return Resolution::Drop {
                    conflict: ConflictRecord::new(
                        edit,
                        server,
                        ConflictStatus::AutoMerged,
                        "delete wins",
                    ),
                    notice: Some(notice),
                };
            }
            return manual("record was deleted on the server");
        }

        match edit.op {
            OpKind::Delete => return manual("record changed on the server after it was deleted here"),
            OpKind::Create => return manual("record already exists on the server"),
            OpKind::Update | OpKind::Toggle => {}
        }

        let changed = changed_fields(base, server_record);
        let touched = edit.touched_fields();
        let overlap: Vec<&String> = touched.iter().filter(|f| changed.contains(*f)).collect();

        if overlap.is_empty() {
            return self.resubmit(edit, server_record, edit.payload.clone(), "no overlapping fields");
        }

        let Some(entity) = entity else {
            return manual("no merge strategy declared for this record type");
        };

        let mut payload = edit.payload.clone();
        for field in overlap {
            let Some(strategy) = entity.strategy(field) else {
                return manual(&format!("field '{}' changed on both sides", field));
            };
            let merged = match strategy {
                FieldStrategy::LastWriteWins => {
                    if edit.created_at > server_record.updated_at {
                        MergedField::Keep
                    } else {
                        MergedField::Drop
                    }
                }
                FieldStrategy::Union => {
                    match union_values(server_record.field(field), local_value(edit, field)) {
                        Some(value) => MergedField::Set(value),
                        None => return manual(&format!("field '{}' cannot be unioned", field)),
                    }
                }
            };
            payload = apply_merged_field(edit, payload, field, merged);
        }

        if payload_is_empty(edit.op, &payload) {
            return Resolution::Drop {
                conflict: ConflictRecord::new(
                    edit,
                    server,
                    ConflictStatus::AutoMerged,
                    "server values are newer",
                ),
                notice: None,
            };
        }

        self.resubmit(edit, server_record, payload, "merged with declared strategies")
    }

    fn resubmit(&self, edit: &Edit, server: &Record, payload: Value, reason: &str) -> Resolution {
        let mut merged = edit.clone();
        merged.edit_id = Uuid::new_v4();
        merged.merged_from = Some(edit.edit_id);
        merged.base_version = server.version;
        merged.attempt_count = 0;
        merged.payload = payload;

        Resolution::Resubmit {
            edit: merged,
            conflict: ConflictRecord::new(edit, Some(server), ConflictStatus::AutoMerged, reason),
        }
    }
}

enum MergedField {
    Keep,
    Drop,
    Set(Value),
}

/// Fields whose value differs between the base snapshot and the server.
fn changed_fields(base: Option<&Record>, server: &Record) -> HashSet<String> {
    let empty = Map::new();
    let base_fields = base.map(|r| &r.fields).unwrap_or(&empty);

    base_fields
        .keys()
        .chain(server.fields.keys())
        .filter(|key| base_fields.get(*key) != server.fields.get(*key))
        .cloned()
        .collect()
}

fn local_value<'a>(edit: &'a Edit, field: &str) -> Option<&'a Value> {
    match edit.op {
        OpKind::Toggle => edit.payload.get("value"),
        _ => edit.payload.get(field),
    }
}

/// Server elements first, then local elements the server lacks.
fn union_values(server: Option<&Value>, local: Option<&Value>) -> Option<Value> {
    let server_items = match server {
        Some(Value::Array(items)) => items.clone(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return None,
    };
    let local_items = match local {
        Some(Value::Array(items)) => items,
        _ => return None,
    };

    let mut merged = server_items;
    for item in local_items {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    Some(Value::Array(merged))
}

fn apply_merged_field(edit: &Edit, payload: Value, field: &str, merged: MergedField) -> Value {
    match (edit.op, merged) {
        (_, MergedField::Keep) => payload,
        (OpKind::Toggle, MergedField::Drop) => Value::Null,
        (OpKind::Toggle, MergedField::Set(_)) => payload,
        (_, MergedField::Drop) => {
            let mut fields = payload.as_object().cloned().unwrap_or_default();
            fields.remove(field);
            Value::Object(fields)
        }
        (_, MergedField::Set(value)) => {
            let mut fields = payload.as_object().cloned().unwrap_or_default();
            fields.insert(field.to_string(), value);
            Value::Object(fields)
        }
    }
}

fn payload_is_empty(op: OpKind, payload: &Value) -> bool {
    match op {
        OpKind::Toggle => payload.is_null(),
        _ => payload.as_object().map(|f| f.is_empty()).unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fields;
    use chrono::Duration;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn record(id: &str, kind: EntityKind, version: u64, value: Value) -> Record {
        Record::new(id, kind, fields(value)).with_version(version)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::default()
    }

    #[test]
    fn test_rename_racing_delete_is_discarded_with_notice() {
        let base = record("pm-007", EntityKind::MealPlan, 1, json!({"title": "Chicken Stir Fry"}));
        let mut server = base.clone().with_version(2);
        server.deleted = true;
        let rename = Edit::update(
            "pm-007",
            EntityKind::MealPlan,
            fields(json!({"title": "Stir Fry Night"})),
            1,
        );

        match resolver().resolve(&rename, Some(&server), Some(&base)) {
            Resolution::Drop { conflict, notice } => {
                assert_eq!(conflict.resolution, ConflictStatus::AutoMerged);
                assert!(notice.unwrap().contains("discarded"));
            }
            other => panic!("Expected Drop, got {:?}", other),
        }
    }

    #[test]
    fn test_create_over_server_tombstone_is_rebased() {
        let mut server = record("gi-milk", EntityKind::GroceryItem, 4, json!({"name": "Milk"}));
        server.deleted = true;
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk again"})));
        let at = Utc::now() - Duration::days(1);

        match resolver().resolve(&create, Some(&server), None).with_detected_at(at) {
            Resolution::Resubmit { edit, conflict } => {
                assert_eq!(edit.op, OpKind::Create);
                assert_eq!(edit.base_version, 4);
                assert_eq!(edit.merged_from, Some(create.edit_id));
                assert_eq!(edit.payload, create.payload);
                assert_eq!(conflict.detected_at, at);
            }
            other => panic!("Expected Resubmit, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_of_deleted_record_converges() {
        let mut server = record("gi-001", EntityKind::GroceryItem, 3, json!({}));
        server.deleted = true;
        let delete = Edit::delete("gi-001", EntityKind::GroceryItem, 2);

        assert!(matches!(
            resolver().resolve(&delete, Some(&server), None),
            Resolution::Drop { notice: None, .. }
        ));
    }

    #[test]
    fn test_local_delete_of_changed_record_is_manual() {
        let base = record("gi-001", EntityKind::GroceryItem, 1, json!({"name": "Milk"}));
        let server = record("gi-001", EntityKind::GroceryItem, 2, json!({"name": "Oat milk"}));
        let delete = Edit::delete("gi-001", EntityKind::GroceryItem, 1);

        match resolver().resolve(&delete, Some(&server), Some(&base)) {
            Resolution::Manual(conflict) => {
                assert_eq!(conflict.resolution, ConflictStatus::ManualPending);
                assert_eq!(conflict.server_record, Some(server));
            }
            other => panic!("Expected Manual, got {:?}", other),
        }
    }

    #[test]
    fn test_disjoint_fields_are_rebased() {
        let base = record(
            "pm-003",
            EntityKind::MealPlan,
            1,
            json!({"title": "Pasta Primavera", "cook": "hm-001"}),
        );
        let server = record(
            "pm-003",
            EntityKind::MealPlan,
            2,
            json!({"title": "Pasta Primavera", "cook": "hm-002"}),
        );
        let rename = Edit::update(
            "pm-003",
            EntityKind::MealPlan,
            fields(json!({"title": "Pasta Primavera v2"})),
            1,
        );

        match resolver().resolve(&rename, Some(&server), Some(&base)) {
            Resolution::Resubmit { edit, conflict } => {
                assert_eq!(edit.base_version, 2);
                assert_eq!(edit.merged_from, Some(rename.edit_id));
                assert_ne!(edit.edit_id, rename.edit_id);
                assert_eq!(edit.payload, rename.payload);
                assert_eq!(conflict.resolution, ConflictStatus::AutoMerged);
            }
            other => panic!("Expected Resubmit, got {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_free_text_is_manual() {
        let base = record("pm-003", EntityKind::MealPlan, 1, json!({"title": "Tacos"}));
        let server = record("pm-003", EntityKind::MealPlan, 2, json!({"title": "Taco Tuesday"}));
        let rename = Edit::update(
            "pm-003",
            EntityKind::MealPlan,
            fields(json!({"title": "Fish Tacos"})),
            1,
        );

        assert!(matches!(
            resolver().resolve(&rename, Some(&server), Some(&base)),
            Resolution::Manual(_)
        ));
    }

    #[test]
    fn test_toggle_last_write_wins() {
        let base = record("gi-milk", EntityKind::GroceryItem, 1, json!({"checked": false}));
        let mut server = record("gi-milk", EntityKind::GroceryItem, 2, json!({"checked": true}));

        let toggle = Edit::toggle("gi-milk", EntityKind::GroceryItem, "checked", false, 1);

        // Local toggle is newer: resubmitted
        server.updated_at = toggle.created_at - Duration::seconds(30);
        match resolver().resolve(&toggle, Some(&server), Some(&base)) {
            Resolution::Resubmit { edit, .. } => {
                assert_eq!(edit.toggle_target(), Some(("checked", false)));
                assert_eq!(edit.base_version, 2);
            }
            other => panic!("Expected Resubmit, got {:?}", other),
        }

        // Server write is newer: local toggle dropped
        server.updated_at = toggle.created_at + Duration::seconds(30);
        assert!(matches!(
            resolver().resolve(&toggle, Some(&server), Some(&base)),
            Resolution::Drop { notice: None, .. }
        ));

        // Tie goes to the server
        server.updated_at = toggle.created_at;
        assert!(matches!(
            resolver().resolve(&toggle, Some(&server), Some(&base)),
            Resolution::Drop { .. }
        ));
    }

    #[test]
    fn test_additive_collection_is_unioned() {
        let base = record("gl-week", EntityKind::GroceryList, 1, json!({"items": ["milk"]}));
        let server = record(
            "gl-week",
            EntityKind::GroceryList,
            2,
            json!({"items": ["milk", "eggs"]}),
        );
        let add = Edit::update(
            "gl-week",
            EntityKind::GroceryList,
            fields(json!({"items": ["milk", "bread"]})),
            1,
        );

        match resolver().resolve(&add, Some(&server), Some(&base)) {
            Resolution::Resubmit { edit, .. } => {
                assert_eq!(edit.payload, json!({"items": ["milk", "eggs", "bread"]}));
            }
            other => panic!("Expected Resubmit, got {:?}", other),
        }
    }

    #[test]
    fn test_merged_edit_conflicting_again_is_manual() {
        let server = record("pm-003", EntityKind::MealPlan, 3, json!({"title": "Tacos"}));
        let mut edit = Edit::update(
            "pm-003",
            EntityKind::MealPlan,
            fields(json!({"cook": "hm-002"})),
            2,
        );
        edit.merged_from = Some(Uuid::new_v4());

        assert!(matches!(
            resolver().resolve(&edit, Some(&server), None),
            Resolution::Manual(_)
        ));
    }

    #[test]
    fn test_manual_only_policy_never_merges_overlaps() {
        let base = record("gi-milk", EntityKind::GroceryItem, 1, json!({"checked": false}));
        let server = record("gi-milk", EntityKind::GroceryItem, 2, json!({"checked": true}));
        let toggle = Edit::toggle("gi-milk", EntityKind::GroceryItem, "checked", false, 1);

        let resolver = ConflictResolver::new(MergePolicy::manual_only());
        assert!(matches!(
            resolver.resolve(&toggle, Some(&server), Some(&base)),
            Resolution::Manual(_)
        ));
    }

    #[test]
    fn test_conflict_choice_parse() {
        assert_eq!("mine".parse::<ConflictChoice>(), Ok(ConflictChoice::KeepMine));
        assert_eq!("Theirs".parse::<ConflictChoice>(), Ok(ConflictChoice::KeepTheirs));
        assert!("both".parse::<ConflictChoice>().is_err());
    }
}
