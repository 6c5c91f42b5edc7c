//! JSON wire types shared by [`HttpBackend`](super::HttpBackend) and the
//! sync server.
//!
//! `POST /edits` takes an [`Edit`](crate::model::Edit) as its body and
//! answers with an [`ApplyResponse`]:
//!
//! | Status | Body |
//! |--------|------|
//! | 200 | `{"status": "applied", "record": ..., "new_version": n}` |
//! | 409 | `{"status": "rejected", "reason": {"kind": "version_conflict"}, "current": ...}` |
//! | 422 | `{"status": "rejected", "reason": {"kind": "validation", "message": ...}, ...}` |

use serde::{Deserialize, Serialize};

use super::{Applied, Rejection};

pub const EDITS_PATH: &str = "/edits";
pub const HEALTH_PATH: &str = "/health";
pub const RECORDS_PATH: &str = "/records";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyResponse {
    Applied(Applied),
    Rejected(Rejection),
}

impl From<Result<Applied, Rejection>> for ApplyResponse {
    fn from(result: Result<Applied, Rejection>) -> Self {
        match result {
            Ok(applied) => ApplyResponse::Applied(applied),
            Err(rejection) => ApplyResponse::Rejected(rejection),
        }
    }
}

/// Body of non-protocol errors (auth, not found, server faults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RejectReason;
    use crate::model::{EntityKind, Fields, Record};
    use serde_json::json;

    #[test]
    fn test_conflict_wire_shape() {
        let response = ApplyResponse::Rejected(Rejection {
            reason: RejectReason::VersionConflict,
            current: None,
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"status": "rejected", "reason": {"kind": "version_conflict"}, "current": null})
        );
    }

    #[test]
    fn test_applied_wire_shape() {
        let record = Record::new("gi-milk", EntityKind::GroceryItem, Fields::new()).with_version(2);
        let value = serde_json::to_value(ApplyResponse::Applied(Applied::new(record))).unwrap();
        assert_eq!(value["status"], "applied");
        assert_eq!(value["new_version"], 2);
        assert_eq!(value["record"]["record_id"], "gi-milk");
    }

    #[test]
    fn test_validation_message_survives() {
        let json = r#"{"status":"rejected","reason":{"kind":"validation","message":"update has no fields"},"current":null}"#;
        let response: ApplyResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            response,
            ApplyResponse::Rejected(Rejection {
                reason: RejectReason::Validation("update has no fields".to_string()),
                current: None,
            })
        );
    }
}
