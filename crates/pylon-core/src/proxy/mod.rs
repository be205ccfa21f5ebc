//! The forwarding engine and its SSE machinery.

pub mod engine;
pub mod sse;

pub use engine::{ForwardContext, ProxyEngine};

use axum::http::{header, HeaderMap};

/// Whether the client asked for a streaming response: an
/// `Accept: text/event-stream` header, or `"stream": true` in a JSON body
/// (the convention of OpenAI-style APIs).
///
/// This decides which concurrency gauge the request occupies. The proxy
/// branch itself follows the downstream response's content type.
#[must_use]
pub fn wants_event_stream(headers: &HeaderMap, body: &[u8]) -> bool {
    let accepts_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    if accepts_stream {
        return true;
    }

    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}
