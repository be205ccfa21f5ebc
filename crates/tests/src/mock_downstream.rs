//! A small downstream API the proxy forwards to during tests.

use axum::{
    body::Body,
    extract::Query,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
    routing::{any, get},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use std::{convert::Infallible, net::SocketAddr, time::Duration};

pub async fn spawn() -> SocketAddr {
    let app = Router::new()
        .route("/api/hello", get(hello))
        .route("/api/slow", get(slow))
        .route("/api/error", get(error))
        .route("/api/stream", any(stream))
        .route("/api/echo-headers", get(echo_headers));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("downstream should bind an ephemeral port");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("downstream serve should not fail");
    });
    addr
}

async fn hello() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "hello" }))
}

#[derive(Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

async fn slow(Query(params): Query<SlowParams>) -> Json<serde_json::Value> {
    let ms = params.ms.unwrap_or(500);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Json(serde_json::json!({ "slept_ms": ms }))
}

async fn error() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": "boom" })))
}

async fn echo_headers(headers: axum::http::HeaderMap) -> Json<serde_json::Value> {
    let names: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
    Json(serde_json::json!({ "header_names": names }))
}

#[derive(Deserialize)]
struct StreamParams {
    count: Option<usize>,
    interval_ms: Option<u64>,
    stall: Option<bool>,
}

/// Emits `count` SSE messages, one per interval, then either closes or
/// stalls with the connection open.
async fn stream(Query(params): Query<StreamParams>) -> Response {
    let count = params.count.unwrap_or(5);
    let interval = Duration::from_millis(params.interval_ms.unwrap_or(20));
    let stall = params.stall.unwrap_or(false);

    let body = futures::stream::unfold(0usize, move |i| async move {
        if i < count {
            tokio::time::sleep(interval).await;
            let frame = Bytes::from(format!("data: msg-{i}\n\n"));
            Some((Ok::<_, Infallible>(frame), i + 1))
        } else if stall {
            futures::future::pending().await
        } else {
            None
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .expect("static response must build")
}
