//! Management API handlers: login, key CRUD, policy, monitor, statistics.

use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use pylon_core::{
    auth::{
        api_key::{ApiKey, Priority},
        repository::KeyUpdate,
        AuthError,
    },
    policy::{LimitRule, PolicyError},
    stats,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JSON error body with a stable `code`, shared by every admin handler.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "code": self.code, "message": self.message })),
        )
            .into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::NotFound => Self::new(StatusCode::NOT_FOUND, "not_found", "API key not found"),
            AuthError::StillActive => Self::new(
                StatusCode::CONFLICT,
                "still_active",
                "API key must be revoked or expired before deletion",
            ),
            other => {
                tracing::error!(error = %other, "key store operation failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Storage failure")
            }
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnknownKey(_) | PolicyError::InvalidValue { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_policy", e.to_string())
            }
            PolicyError::Database(e) => {
                tracing::error!(error = %e, "policy storage failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Storage failure")
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!(error = %e, "database query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Storage failure")
    }
}

// ---------------------------------------------------------------------------
// Login

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    match state.admin_auth.login(&body.password) {
        Some((token, expires_at)) => Ok(Json(LoginResponse { token, expires_at })),
        None => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Invalid password",
        )),
    }
}

pub async fn admin_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// API keys

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    #[serde(default)]
    pub include_revoked: bool,
    #[serde(default)]
    pub include_expired: bool,
}

pub async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    Ok(Json(
        state
            .keystore
            .list(query.include_revoked, query.include_expired)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub expires_in_days: Option<i64>,
    pub limit_overrides: Option<LimitRule>,
}

/// The raw key appears here and nowhere else.
#[derive(Debug, Serialize)]
pub struct CreatedKeyResponse {
    pub key: String,
    pub api_key: ApiKey,
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), ApiError> {
    let (key, api_key) = state
        .keystore
        .create(body.description, body.priority, body.expires_in_days, body.limit_overrides)
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedKeyResponse { key, api_key })))
}

pub async fn key_counts(
    State(state): State<AppState>,
) -> Result<Json<pylon_core::auth::repository::KeyCounts>, ApiError> {
    Ok(Json(state.keystore.counts().await?))
}

pub async fn get_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>, ApiError> {
    Ok(Json(state.keystore.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub expires_at: Option<DateTime<Utc>>,
    pub limit_overrides: Option<LimitRule>,
}

pub async fn update_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateKeyRequest>,
) -> Result<Json<ApiKey>, ApiError> {
    let update = KeyUpdate {
        description: body.description,
        priority: body.priority,
        expires_at: body.expires_at.map(Some),
        limit_overrides: body.limit_overrides.map(Some),
    };
    Ok(Json(state.keystore.update(&id, update).await?))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>, ApiError> {
    Ok(Json(state.keystore.revoke(&id).await?))
}

pub async fn refresh_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CreatedKeyResponse>, ApiError> {
    let (key, api_key) = state.keystore.refresh(&id).await?;
    Ok(Json(CreatedKeyResponse { key, api_key }))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.keystore.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Policy

pub async fn get_policy(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.policy.load();
    Json(serde_json::to_value(snapshot.as_ref()).unwrap_or(serde_json::Value::Null))
}

/// Accepts the flat persisted form, e.g.
/// `{"queue.max_size": 50, "rate_limit.default_user": {...}}`. The new
/// snapshot is installed atomically; in-flight requests keep the one they
/// loaded at entry.
pub async fn update_policy(
    State(state): State<AppState>,
    Json(items): Json<HashMap<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.policy_store.set_many(&items).await?;
    tracing::info!(keys = items.len(), "policy updated");
    let snapshot = state.policy.load();
    Ok(Json(serde_json::to_value(snapshot.as_ref()).unwrap_or(serde_json::Value::Null)))
}

// ---------------------------------------------------------------------------
// Monitor & statistics

pub async fn monitor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let counters = state.admission.bank().snapshot();
    let queue = state.admission.queue();
    let [high, normal, low] = queue.depth_by_priority();

    Json(serde_json::json!({
        "queue_size": queue.len(),
        "queue_by_priority": { "high": high, "normal": normal, "low": low },
        "active_unary": counters.active_unary,
        "active_sse": counters.active_sse,
        "requests_last_minute": counters.requests_last_minute,
        "tracked_identities": counters.tracked_identities,
        "recorder_pending": state.recorder.pending(),
        "recorder_dropped": state.recorder.dropped(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

pub async fn stats_summary(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<stats::StatsSummary>, ApiError> {
    let (start, end) = stats::default_range(query.start, query.end);
    Ok(Json(stats::summary(&state.pool, start, end).await?))
}

pub async fn stats_users(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<stats::UserStats>>, ApiError> {
    let (start, end) = stats::default_range(query.start, query.end);
    Ok(Json(stats::by_user(&state.pool, start, end).await?))
}

pub async fn stats_apis(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<stats::ApiStats>>, ApiError> {
    let (start, end) = stats::default_range(query.start, query.end);
    Ok(Json(stats::by_api(&state.pool, start, end).await?))
}
