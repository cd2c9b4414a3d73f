//! REST endpoints for buckets, rules, threads, and classification runs.
//!
//! Authentication happens upstream; the proxy forwards the caller's id in
//! the `X-User-Id` header and every handler scopes its work to that user.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ClassifyError, DatabaseError};
use crate::pipeline::rules::priority_for_bucket;
use crate::pipeline::types::{Rule, RuleType};
use crate::pipeline::{BucketRegistry, ClassificationOrchestrator};
use crate::store::Database;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Most threads returned by the listing endpoint.
const THREAD_LIST_LIMIT: usize = 200;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub registry: Arc<BucketRegistry>,
    pub orchestrator: Arc<ClassificationOrchestrator>,
}

/// Build the Axum router with all triage routes.
pub fn api_routes(store: Arc<dyn Database>, orchestrator: Arc<ClassificationOrchestrator>) -> Router {
    let state = AppState {
        registry: Arc::new(BucketRegistry::new(Arc::clone(&store))),
        store,
        orchestrator,
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/classify/run", post(run_classification))
        .route("/api/buckets", get(list_buckets).post(create_bucket))
        .route("/api/buckets/{id}", delete(delete_bucket))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", delete(delete_rule))
        .route("/api/threads", get(list_threads))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response: `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => Self::not_found(e.to_string()),
            DatabaseError::Constraint(msg) => Self::new(StatusCode::CONFLICT, msg),
            other => {
                error!(error = %other, "Database failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
        }
    }
}

impl From<ClassifyError> for ApiError {
    fn from(e: ClassifyError) -> Self {
        let status = match &e {
            ClassifyError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            ClassifyError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClassifyError::Llm(_) | ClassifyError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

// ── Caller identity ─────────────────────────────────────────────────────

/// The user on whose behalf a request runs.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Classification ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunParams {
    n: Option<usize>,
    force: Option<String>,
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

async fn run_classification(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(params): Query<RunParams>,
) -> Result<impl IntoResponse, ApiError> {
    let n = params
        .n
        .unwrap_or(state.orchestrator.config().default_window);
    let force = params.force.as_deref().is_some_and(is_truthy);

    info!(user_id, n, force, "Classification run requested");
    let summary = state.orchestrator.run(&user_id, n, force).await?;
    Ok(Json(summary))
}

// ── Buckets ─────────────────────────────────────────────────────────────

async fn list_buckets(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, ApiError> {
    let buckets = state.registry.ensure_defaults(&user_id).await?;
    Ok(Json(buckets))
}

#[derive(Debug, Deserialize)]
struct CreateBucketRequest {
    name: String,
    description: Option<String>,
}

async fn create_bucket(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<CreateBucketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Bucket name is required"));
    }
    // Seed defaults first so a custom bucket never blocks them.
    state.registry.ensure_defaults(&user_id).await?;

    let bucket = state
        .store
        .create_bucket(&user_id, &body.name, body.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

async fn delete_bucket(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request("Invalid bucket ID"))?;
    if state.store.delete_bucket(&user_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Bucket not found"))
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

async fn list_rules(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, ApiError> {
    let rules = state.store.list_rules(&user_id).await?;
    Ok(Json(rules))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRuleRequest {
    bucket_id: String,
    #[serde(rename = "type")]
    rule_type: RuleType,
    pattern: String,
    #[serde(default)]
    is_high_priority: bool,
}

async fn create_rule(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<CreateRuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.pattern.trim().is_empty() {
        return Err(ApiError::bad_request("Rule pattern is required"));
    }
    let bucket_id =
        Uuid::parse_str(&body.bucket_id).map_err(|_| ApiError::bad_request("Invalid bucket ID"))?;
    let bucket = state
        .store
        .get_bucket(&user_id, bucket_id)
        .await?
        .ok_or_else(|| ApiError::bad_request("Unknown bucket"))?;

    let rule = Rule {
        id: Uuid::new_v4(),
        user_id,
        bucket_id: bucket.id,
        rule_type: body.rule_type,
        pattern: body.pattern.trim().to_string(),
        priority: priority_for_bucket(&bucket.slug, body.is_high_priority),
        created_at: Utc::now(),
    };
    state.store.create_rule(&rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn delete_rule(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request("Invalid rule ID"))?;
    if state.store.delete_rule(&user_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        warn!(user_id, rule_id = %id, "Delete requested for unknown rule");
        Err(ApiError::not_found("Rule not found"))
    }
}

// ── Threads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ThreadParams {
    bucket: Option<String>,
}

async fn list_threads(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(params): Query<ThreadParams>,
) -> Result<impl IntoResponse, ApiError> {
    let bucket = params.bucket.as_deref().filter(|b| !b.is_empty());
    let threads = state
        .store
        .list_threads(&user_id, bucket, THREAD_LIST_LIMIT)
        .await?;
    Ok(Json(threads))
}
