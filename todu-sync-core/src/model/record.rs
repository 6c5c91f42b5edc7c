//! Records: the mutable entities kept in sync with the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field map of a record.
pub type Fields = Map<String, Value>;

/// Identifier of a record (e.g. `"pm-003"` for a planned meal).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Entity types that flow through the sync pipeline.
///
/// The kind selects the merge strategies the conflict resolver may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    GroceryItem,
    GroceryList,
    MealPlan,
    Notification,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::GroceryItem => "grocery_item",
            EntityKind::GroceryList => "grocery_list",
            EntityKind::MealPlan => "meal_plan",
            EntityKind::Notification => "notification",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "grocery_item" => Ok(EntityKind::GroceryItem),
            "grocery_list" => Ok(EntityKind::GroceryList),
            "meal_plan" | "mealplan" => Ok(EntityKind::MealPlan),
            "notification" => Ok(EntityKind::Notification),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// A record as known to the server (or projected locally).
///
/// Deletions are kept as tombstones so the server can report the version
/// at which a record disappeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    pub kind: EntityKind,
    /// Version assigned by the server; 0 means never confirmed.
    pub version: u64,
    pub fields: Fields,
    #[serde(default)]
    pub deleted: bool,
    /// Logical time of the last write applied to this record.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(record_id: impl Into<RecordId>, kind: EntityKind, fields: Fields) -> Self {
        Self {
            record_id: record_id.into(),
            kind,
            version: 0,
            fields,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    /// Returns the record only if it is not a tombstone.
    pub fn live(&self) -> Option<&Record> {
        if self.deleted {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.record_id, self.kind)?;
        writeln!(f, "Version: {}", self.version)?;
        if self.deleted {
            writeln!(f, "Deleted")?;
        }
        for (key, value) in &self.fields {
            writeln!(f, "  {}: {}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_record_id_display() {
        let id = RecordId::from("pm-003");
        assert_eq!(id.to_string(), "pm-003");
        assert_eq!(id.as_str(), "pm-003");
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("meal-plan".parse::<EntityKind>(), Ok(EntityKind::MealPlan));
        assert_eq!(
            "Grocery_Item".parse::<EntityKind>(),
            Ok(EntityKind::GroceryItem)
        );
        assert!("recipe".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_record_field_accessors() {
        let record = Record::new(
            "gi-001",
            EntityKind::GroceryItem,
            fields(json!({"name": "Milk", "checked": false})),
        );
        assert_eq!(record.str_field("name"), Some("Milk"));
        assert_eq!(record.bool_field("checked"), Some(false));
        assert!(record.field("quantity").is_none());
    }

    #[test]
    fn test_tombstone_is_not_live() {
        let mut record = Record::new("gi-001", EntityKind::GroceryItem, Fields::new());
        assert!(record.live().is_some());
        record.deleted = true;
        assert!(record.live().is_none());
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = Record::new(
            "pm-003",
            EntityKind::MealPlan,
            fields(json!({"title": "Pasta Primavera", "cook": "hm-001"})),
        )
        .with_version(4);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"record_id\":\"pm-003\""));
        assert!(json.contains("\"kind\":\"meal_plan\""));

        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
