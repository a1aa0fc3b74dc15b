use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use travelgrid_core::models::{
    AuditEntry, Change, ConflictStatus, DataConflict, DeviceInfo, DeviceSyncRecord,
    ResolutionRequest, ResolutionStrategy, ResolvedBy,
};
use travelgrid_core::util::{require_text, timestamp_from_value, user_fingerprint};
use travelgrid_core::{ConflictId, DataType, SyncOutcome, SyncRequest, SyncService};

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    sync: SyncService,
    jwt_verifier: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, sync: SyncService) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::new(config.clone())),
            sync: sync.with_max_batch_size(config.max_changes_per_batch),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/register-device", post(register_device))
        .route("/status", get(sync_status))
        .route("/sync", post(sync_data))
        .route("/conflicts", get(list_conflicts))
        .route("/resolve-conflict", post(resolve_conflict))
        .route("/discard-conflict", post(discard_conflict))
        .route("/audit-trail", get(audit_trail))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let sync_routes = Router::new()
        .route("/generate-device-id", get(generate_device_id))
        .merge(protected_routes);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/sync", sync_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// The requested user must be the authenticated principal.
fn authorize(user: &AuthenticatedUser, requested: Option<&str>) -> Result<String, AppError> {
    let requested = require_text(requested.unwrap_or_default(), "userId")?;
    if requested != user.user_id {
        tracing::warn!(
            user = user_fingerprint(&user.user_id),
            "Rejected request for another user's data"
        );
        return Err(AppError::forbidden("Cannot access another user's sync data"));
    }
    Ok(requested)
}

fn required_data_type(value: Option<&str>) -> Result<DataType, AppError> {
    Ok(require_text(value.unwrap_or_default(), "dataType")?.parse::<DataType>()?)
}

fn optional_data_type(value: Option<&str>) -> Result<Option<DataType>, AppError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::parse::<DataType>)
        .transpose()
        .map_err(AppError::from)
}

fn parse_conflict_id(value: Option<&str>) -> Result<ConflictId, AppError> {
    let value = require_text(value.unwrap_or_default(), "conflictId")?;
    value
        .parse()
        .map_err(|_| AppError::bad_request("conflictId must be a UUID"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceIdResponse {
    device_id: String,
}

async fn generate_device_id() -> Json<DeviceIdResponse> {
    Json(DeviceIdResponse {
        device_id: travelgrid_core::generate_device_id(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceRequest {
    user_id: Option<String>,
    device_id: Option<String>,
    #[serde(default)]
    device_info: DeviceInfo,
    data_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceResponse {
    message: &'static str,
    sync_metadata: DeviceSyncRecord,
}

async fn register_device(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> Result<Json<RegisterDeviceResponse>, AppError> {
    let Json(request) = payload?;
    let user_id = authorize(&user, request.user_id.as_deref())?;
    let device_id = require_text(request.device_id.as_deref().unwrap_or_default(), "deviceId")?;
    let data_type = required_data_type(request.data_type.as_deref())?;

    let record = state
        .sync
        .register_device(&user_id, &device_id, data_type, &request.device_info)
        .await?;
    Ok(Json(RegisterDeviceResponse {
        message: "Device registered for sync",
        sync_metadata: record,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    user_id: Option<String>,
    device_id: Option<String>,
    data_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    sync_metadata: Vec<DeviceSyncRecord>,
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    let Query(query) = query?;
    let user_id = authorize(&user, query.user_id.as_deref())?;
    let data_type = optional_data_type(query.data_type.as_deref())?;

    let records = state
        .sync
        .get_sync_status(&user_id, query.device_id.as_deref(), data_type)
        .await?;
    Ok(Json(StatusResponse {
        sync_metadata: records,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncDataRequest {
    user_id: Option<String>,
    device_id: Option<String>,
    data_type: Option<String>,
    changes: Option<Vec<Change>>,
    #[serde(default)]
    last_sync_timestamp: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncDataResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: SyncOutcome,
}

async fn sync_data(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<SyncDataRequest>, JsonRejection>,
) -> Result<Json<SyncDataResponse>, AppError> {
    let Json(request) = payload?;
    let user_id = authorize(&user, request.user_id.as_deref())?;
    let device_id = require_text(request.device_id.as_deref().unwrap_or_default(), "deviceId")?;
    let data_type = required_data_type(request.data_type.as_deref())?;
    let changes = request
        .changes
        .ok_or_else(|| AppError::bad_request("changes must be an array"))?;
    let last_sync_timestamp = timestamp_from_value(&request.last_sync_timestamp, "lastSyncTimestamp")?;

    let outcome = state
        .sync
        .sync_data(SyncRequest {
            user_id,
            device_id,
            data_type,
            changes,
            last_sync_timestamp,
        })
        .await?;
    Ok(Json(SyncDataResponse {
        message: "Sync completed",
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictsQuery {
    user_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConflictsResponse {
    conflicts: Vec<DataConflict>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    query: Result<Query<ConflictsQuery>, QueryRejection>,
) -> Result<Json<ConflictsResponse>, AppError> {
    let Query(query) = query?;
    let user_id = authorize(&user, query.user_id.as_deref())?;
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => ConflictStatus::Pending,
        Some(status) => status.parse::<ConflictStatus>()?,
    };

    let conflicts = state.sync.get_conflicts(&user_id, status).await?;
    Ok(Json(ConflictsResponse { conflicts }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolutionBody {
    strategy: Option<String>,
    resolved_by: Option<String>,
    resolution_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveConflictRequest {
    conflict_id: Option<String>,
    resolution: Option<ResolutionBody>,
}

#[derive(Debug, Serialize)]
struct ConflictResponse {
    message: &'static str,
    conflict: DataConflict,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<ResolveConflictRequest>, JsonRejection>,
) -> Result<Json<ConflictResponse>, AppError> {
    let Json(request) = payload?;
    let conflict_id = parse_conflict_id(request.conflict_id.as_deref())?;
    let resolution = request
        .resolution
        .ok_or_else(|| AppError::bad_request("resolution is required"))?;
    let strategy = require_text(resolution.strategy.as_deref().unwrap_or_default(), "strategy")?;
    let resolved_by = match resolution.resolved_by.as_deref().map(str::trim) {
        None | Some("") => ResolvedBy::User,
        Some(resolved_by) => resolved_by.parse::<ResolvedBy>()?,
    };

    let conflict = state
        .sync
        .resolve_conflict(
            &user.user_id,
            &conflict_id,
            &ResolutionRequest {
                strategy: strategy.parse::<ResolutionStrategy>()?,
                resolved_by,
                resolution_data: resolution.resolution_data,
            },
        )
        .await?;
    Ok(Json(ConflictResponse {
        message: "Conflict resolved",
        conflict,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscardConflictRequest {
    conflict_id: Option<String>,
}

async fn discard_conflict(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<DiscardConflictRequest>, JsonRejection>,
) -> Result<Json<ConflictResponse>, AppError> {
    let Json(request) = payload?;
    let conflict_id = parse_conflict_id(request.conflict_id.as_deref())?;
    let conflict = state
        .sync
        .discard_conflict(&user.user_id, &conflict_id)
        .await?;
    Ok(Json(ConflictResponse {
        message: "Conflict discarded",
        conflict,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditResponse {
    audit_trail: Vec<AuditEntry>,
}

async fn audit_trail(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Json<AuditResponse>, AppError> {
    let Query(query) = query?;
    let user_id = authorize(&user, query.user_id.as_deref())?;
    let audit_trail = state.sync.get_audit_trail(&user_id, query.limit).await?;
    Ok(Json(AuditResponse { audit_trail }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request as HttpRequest, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "router-test-secret-0123456789";

    async fn test_app() -> Router {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            jwt_secret: SECRET.to_string(),
            jwt_issuer: None,
            jwt_audience: None,
            auth_clock_skew: Duration::from_secs(30),
            max_changes_per_batch: 10,
        });
        let sync = SyncService::open_in_memory().await.unwrap();
        app_router(AppState::new(config, sync))
    }

    fn bearer(user_id: &str) -> String {
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::default(),
            &json!({"sub": user_id, "exp": now + 600, "iat": now}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("authorization", bearer(user));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn register(app: &Router, device: &str) {
        let (status, _) = call(
            app,
            Method::POST,
            "/api/sync/register-device",
            Some("traveler"),
            Some(json!({
                "userId": "traveler",
                "deviceId": device,
                "dataType": "trip",
                "deviceInfo": {"platform": "web"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn sync(app: &Router, device: &str, change: Value) -> (StatusCode, Value) {
        call(
            app,
            Method::POST,
            "/api/sync/sync",
            Some("traveler"),
            Some(json!({
                "userId": "traveler",
                "deviceId": device,
                "dataType": "trip",
                "changes": [change]
            })),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_and_device_id_are_public() {
        let app = test_app().await;

        let (status, body) = call(&app, Method::GET, "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, first) = call(&app, Method::GET, "/api/sync/generate-device-id", None, None).await;
        let (_, second) = call(&app, Method::GET, "/api/sync/generate-device-id", None, None).await;
        let first = first["deviceId"].as_str().unwrap().to_string();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_ne!(Some(first.as_str()), second["deviceId"].as_str());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn protected_routes_require_token() {
        let app = test_app().await;
        let (status, body) = call(
            &app,
            Method::GET,
            "/api/sync/status?userId=traveler",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["message"].as_str().unwrap().contains("Authorization"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_users_data_is_forbidden() {
        let app = test_app().await;
        let (status, _) = call(
            &app,
            Method::GET,
            "/api/sync/conflicts?userId=someone-else",
            Some("traveler"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_device_validates_fields() {
        let app = test_app().await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/register-device",
            Some("traveler"),
            Some(json!({"userId": "traveler", "dataType": "trip"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "deviceId is required");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/sync/register-device",
            Some("traveler"),
            Some(json!({"userId": "traveler", "deviceId": "d1", "dataType": "photos"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_from_unregistered_device_is_rejected() {
        let app = test_app().await;
        let (status, body) = sync(
            &app,
            "ghost",
            json!({"id": "t1", "operation": "create", "data": {}, "timestamp": "2026-05-01T10:00:00Z"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Device not registered for sync");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_edits_flow_through_resolution() {
        let app = test_app().await;
        register(&app, "phone").await;
        register(&app, "laptop").await;

        let (status, _) = sync(
            &app,
            "phone",
            json!({"id": "t1", "operation": "create", "data": {"destination": "Quito"}, "timestamp": "2026-05-01T10:00:00Z"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        sync(
            &app,
            "phone",
            json!({
                "id": "t1", "operation": "update", "data": {"destination": "Cuenca"},
                "timestamp": "2026-05-01T11:00:00Z", "baseTimestamp": "2026-05-01T10:00:00Z"
            }),
        )
        .await;

        let (status, body) = sync(
            &app,
            "laptop",
            json!({
                "id": "t1", "operation": "update", "data": {"destination": "Loja"},
                "timestamp": "2026-05-01T10:30:00Z", "baseTimestamp": "2026-05-01T10:00:00Z"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conflicts"], json!(["t1"]));
        assert_eq!(body["processedChanges"], json!([]));

        let (_, body) = call(
            &app,
            Method::GET,
            "/api/sync/conflicts?userId=traveler",
            Some("traveler"),
            None,
        )
        .await;
        let conflict = &body["conflicts"][0];
        assert_eq!(conflict["conflictType"], "edit_conflict");
        assert_eq!(conflict["localVersion"]["data"]["destination"], "Cuenca");
        let conflict_id = conflict["id"].as_str().unwrap().to_string();

        let resolve = json!({
            "conflictId": conflict_id,
            "resolution": {"strategy": "accept_remote", "resolvedBy": "user"}
        });
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/resolve-conflict",
            Some("traveler"),
            Some(resolve.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conflict"]["status"], "resolved");

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/resolve-conflict",
            Some("traveler"),
            Some(resolve),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Conflict already resolved");

        let (status, body) = call(
            &app,
            Method::GET,
            "/api/sync/audit-trail?userId=traveler&limit=1",
            Some("traveler"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["auditTrail"][0]["action"], "resolve");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_or_foreign_conflict_is_not_found() {
        let app = test_app().await;
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/sync/discard-conflict",
            Some("traveler"),
            Some(json!({"conflictId": ConflictId::new().to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/discard-conflict",
            Some("traveler"),
            Some(json!({"conflictId": "not-a-uuid"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "conflictId must be a UUID");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_batch_is_rejected() {
        let app = test_app().await;
        register(&app, "phone").await;
        let changes: Vec<Value> = (0..11)
            .map(|i| json!({"id": format!("t{i}"), "operation": "create", "data": {}, "timestamp": "2026-05-01T10:00:00Z"}))
            .collect();

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/sync/sync",
            Some("traveler"),
            Some(json!({"userId": "traveler", "deviceId": "phone", "dataType": "trip", "changes": changes})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_change_fails_alone() {
        let app = test_app().await;
        register(&app, "phone").await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/sync",
            Some("traveler"),
            Some(json!({
                "userId": "traveler",
                "deviceId": "phone",
                "dataType": "trip",
                "lastSyncTimestamp": 1_746_090_000_000_i64,
                "changes": [
                    {"id": "t1", "operation": "create", "data": {"destination": "Quito"}, "timestamp": 1_746_093_600_000_i64},
                    {"id": "bad", "timestamp": 1_746_093_600_000_i64}
                ]
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processedChanges"][0]["id"], "t1");
        assert_eq!(body["processedChanges"][0]["revision"], 1_746_093_600_000_i64);
        assert_eq!(body["failedChanges"][0]["id"], "bad");
        assert_eq!(
            body["failedChanges"][0]["error"],
            "Invalid input: change operation is required"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undecodable_requests_get_message_body() {
        let app = test_app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/sync",
            Some("traveler"),
            Some(json!({"userId": "traveler", "deviceId": "phone", "dataType": "trip", "changes": "none"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("changes"));

        let (status, body) = call(
            &app,
            Method::GET,
            "/api/sync/audit-trail?userId=traveler&limit=lots",
            Some("traveler"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].is_string());

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/sync/sync",
            Some("traveler"),
            Some(json!({
                "userId": "traveler", "deviceId": "phone", "dataType": "trip",
                "changes": [], "lastSyncTimestamp": "not a time"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["message"],
            "lastSyncTimestamp must be an RFC 3339 string or Unix milliseconds"
        );
    }
}
