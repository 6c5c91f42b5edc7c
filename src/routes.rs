//! HTTP routes of the sync server.
//!
//! - `GET /health`: health check (no auth)
//! - `POST /edits`: apply one edit; 200 applied, 409 version conflict,
//!   422 invalid edit
//! - `GET /records/{id}`: current server copy of a record, tombstones
//!   included

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use todu_sync_core::backend::protocol::{
    ApplyResponse, ErrorResponse, HealthResponse, EDITS_PATH, HEALTH_PATH, RECORDS_PATH,
};
use todu_sync_core::{Edit, RecordId, RejectReason, Rejection};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, ApiKeyStore, AuthUser};
use crate::storage::RecordStore;

#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub records: Arc<RecordStore>,
}

pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route(HEALTH_PATH, get(health));

    let protected_routes = Router::new()
        .route(EDITS_PATH, post(apply_edit))
        .route(&format!("{}/{{id}}", RECORDS_PATH), get(get_record))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn apply_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<Edit>, JsonRejection>,
) -> Response {
    let edit = match body {
        Ok(Json(edit)) => edit,
        Err(rejection) => {
            // Malformed edits are permanent failures, never retried.
            let response = ApplyResponse::Rejected(Rejection {
                reason: RejectReason::Validation(rejection.body_text()),
                current: None,
            });
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(response)).into_response();
        }
    };

    let outcome = match state.records.apply(&edit) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(edit_id = %edit.edit_id, error = %e, "failed to persist edit");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist edit");
        }
    };

    let status = match &outcome {
        Ok(applied) => {
            tracing::info!(
                edit_id = %edit.edit_id,
                record_id = %edit.record_id,
                op = %edit.op,
                version = applied.new_version,
                user = %user.user_id,
                "edit applied"
            );
            StatusCode::OK
        }
        Err(Rejection {
            reason: RejectReason::VersionConflict,
            ..
        }) => {
            tracing::info!(
                edit_id = %edit.edit_id,
                record_id = %edit.record_id,
                base_version = edit.base_version,
                "version conflict"
            );
            StatusCode::CONFLICT
        }
        Err(rejection) => {
            tracing::info!(
                edit_id = %edit.edit_id,
                record_id = %edit.record_id,
                reason = %rejection.reason,
                "edit rejected"
            );
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };

    (status, Json(ApplyResponse::from(outcome))).into_response()
}

async fn get_record(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.records.get(&RecordId::new(id.as_str())) {
        Some(record) => Json(record).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("record not found: {}", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use todu_sync_core::{EntityKind, Fields, Record};
    use tower::ServiceExt; // for oneshot

    const KEY: &str = "test-key";

    fn create_test_app() -> (Router, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let state = AppState {
            api_keys: Arc::new(ApiKeyStore::default().with_key(KEY, "alice")),
            records: Arc::new(RecordStore::open(temp_dir.path()).unwrap()),
        };
        (build_router(state), temp_dir)
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn post_edit(edit: &Edit) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(EDITS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(edit).unwrap()))
            .unwrap()
    }

    fn get_path(path: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn response_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _tmp) = create_test_app();
        let response = app.oneshot(get_path(HEALTH_PATH, None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_edits_require_valid_key() {
        let (app, _tmp) = create_test_app();
        let edit = Edit::create("gi-milk", EntityKind::GroceryItem, Fields::new());

        let mut request = post_edit(&edit);
        request.headers_mut().remove(header::AUTHORIZATION);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(get_path("/records/gi-milk", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = response_json(response).await;
        assert_eq!(json["error"], "Invalid API key");
    }

    #[tokio::test]
    async fn test_apply_then_fetch_record() {
        let (app, _tmp) = create_test_app();
        let create = Edit::create("gi-milk", EntityKind::GroceryItem, fields(json!({"name": "Milk"})));

        let response = app.clone().oneshot(post_edit(&create)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "applied");
        assert_eq!(json["new_version"], 1);

        let response = app
            .oneshot(get_path("/records/gi-milk", Some(KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record: Record = serde_json::from_value(response_json(response).await).unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.str_field("name"), Some("Milk"));
    }

    #[tokio::test]
    async fn test_retried_edit_is_applied_once() {
        let (app, _tmp) = create_test_app();
        let create = Edit::create("gl-week", EntityKind::GroceryList, fields(json!({"items": []})));

        let first = app.clone().oneshot(post_edit(&create)).await.unwrap();
        let second = app.oneshot(post_edit(&create)).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(
            response_json(first).await,
            response_json(second).await
        );
    }

    #[tokio::test]
    async fn test_stale_base_is_409_with_current_record() {
        let (app, _tmp) = create_test_app();
        let create = Edit::create("pm-003", EntityKind::MealPlan, fields(json!({"title": "Tacos"})));
        app.clone().oneshot(post_edit(&create)).await.unwrap();
        let rename = Edit::update("pm-003", EntityKind::MealPlan, fields(json!({"title": "Burritos"})), 1);
        app.clone().oneshot(post_edit(&rename)).await.unwrap();

        let stale = Edit::update("pm-003", EntityKind::MealPlan, fields(json!({"title": "Fish Tacos"})), 1);
        let response = app.oneshot(post_edit(&stale)).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = response_json(response).await;
        assert_eq!(json["reason"]["kind"], "version_conflict");
        assert_eq!(json["current"]["version"], 2);
        assert_eq!(json["current"]["fields"]["title"], "Burritos");
    }

    #[tokio::test]
    async fn test_invalid_edit_is_422() {
        let (app, _tmp) = create_test_app();
        let update = Edit::update("pm-404", EntityKind::MealPlan, fields(json!({"title": "x"})), 0);

        let response = app.oneshot(post_edit(&update)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"]["kind"], "validation");
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_validation_rejection() {
        let (app, _tmp) = create_test_app();
        let request = Request::builder()
            .method("POST")
            .uri(EDITS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"record_id": "gi-milk"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: ApplyResponse = serde_json::from_value(response_json(response).await).unwrap();
        assert!(matches!(
            body,
            ApplyResponse::Rejected(Rejection {
                reason: RejectReason::Validation(_),
                current: None
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_record_is_404() {
        let (app, _tmp) = create_test_app();
        let response = app
            .oneshot(get_path("/records/gi-none", Some(KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
