//! The client-facing proxy listener.
//!
//! `GET /health` is the only unauthenticated route; every other method and
//! path runs the full pipeline: bearer-key resolution, admission (rate caps,
//! then concurrency with queueing), then transparent forwarding.

use crate::state::AppState;
use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
    routing::get,
    Router,
};
use chrono::Utc;
use pylon_core::{
    admission::Rejection,
    auth::{extract_bearer, Resolution},
    limits::CheckRules,
    proxy::{wants_event_stream, ForwardContext},
    recorder::RequestRecord,
};
use std::{net::SocketAddr, time::Instant};

/// Largest request body the proxy will buffer for forwarding.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy_request)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.policy.load();
    let downstream_ok = state.engine.health(&snapshot).await;
    let counters = state.admission.bank().snapshot();

    Json(serde_json::json!({
        "status": "ok",
        "downstream": if downstream_ok { "ok" } else { "error" },
        "queue_size": state.admission.queue().len(),
        "active_connections": counters.active_unary,
    }))
}

fn rejection_response(rejection: &Rejection) -> Response {
    (
        rejection.status,
        Json(serde_json::json!({
            "code": rejection.code,
            "message": rejection.message,
        })),
    )
        .into_response()
}

async fn proxy_request(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let request_time = Utc::now();
    let snapshot = state.policy.load();

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string());

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "code": "payload_too_large",
                    "message": "Request body too large",
                })),
            )
                .into_response();
        }
    };

    let is_sse = wants_event_stream(&parts.headers, &body);

    // Authenticate. Unauthenticated requests carry no identity, so they are
    // logged but produce no request-log row.
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(credential) = extract_bearer(bearer) else {
        tracing::warn!(method = %method, path = %path, "request without credential");
        return rejection_response(&Rejection::unauthorized("Missing or invalid API key"));
    };

    let identity = match state.keystore.resolve(credential).await {
        Ok(Resolution::Resolved(identity)) => identity,
        Ok(resolution) => {
            let reason = resolution.deny_reason().unwrap_or("Invalid API key");
            tracing::warn!(method = %method, path = %path, reason, "credential rejected");
            return rejection_response(&Rejection::unauthorized(reason));
        }
        Err(e) => {
            tracing::error!(error = %e, "credential lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "code": "internal_error",
                    "message": "Authentication backend unavailable",
                })),
            )
                .into_response();
        }
    };

    let api = state.admission.resolve_api(method.as_str(), &path, &snapshot);

    match state.admission.admit(&identity, &api, is_sse, &snapshot).await {
        Ok(ticket) => {
            tracing::info!(
                key = %identity.key_prefix,
                api = %ticket.api(),
                sse = is_sse,
                queued = ticket.enqueued_at().is_some(),
                "request admitted"
            );
            let rules = CheckRules::resolve(&snapshot, &identity, &api);
            let ctx = ForwardContext {
                method,
                path,
                query,
                headers: parts.headers,
                body,
                client_ip,
                request_time,
                started,
                rules,
            };
            state.engine.forward(ticket, ctx, &snapshot).await
        }
        Err(rejection) => {
            let elapsed_ms =
                i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            tracing::warn!(
                key = %identity.key_prefix,
                api = %api.identifier,
                status = rejection.status.as_u16(),
                code = rejection.code,
                elapsed_ms,
                "request rejected"
            );
            state.recorder.record(RequestRecord {
                api_key_id: identity.id.clone(),
                api_identifier: api.identifier.clone(),
                request_path: path,
                request_method: method.to_string(),
                response_status: rejection.status.as_u16(),
                request_time,
                response_time_ms: elapsed_ms,
                client_ip,
                is_sse,
                sse_message_count: 0,
            });
            rejection_response(&rejection)
        }
    }
}
