//! End-to-end scenarios for the SSE path.

use crate::harness::{overrides, Harness};
use pylon_core::auth::api_key::Priority;
use serde_json::json;
use std::time::{Duration, Instant};

async fn get_stream(harness: &Harness, path: &str, key: &str) -> reqwest::Response {
    harness
        .client
        .get(harness.proxy(path))
        .bearer_auth(key)
        .header("accept", "text/event-stream")
        .send()
        .await
        .expect("request should reach the proxy")
}

#[tokio::test]
async fn test_sse_passthrough_counts_messages() {
    let harness = Harness::start(overrides(&[])).await;
    let key = harness.create_key(Priority::Normal).await;

    let response = get_stream(&harness, "/api/stream?count=3&interval_ms=10", &key).await;
    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream")),
        "content type must pass through"
    );

    let body = response.text().await.expect("stream should end cleanly");
    assert_eq!(body, "data: msg-0\n\ndata: msg-1\n\ndata: msg-2\n\n");

    let records = harness.wait_for_records(1).await;
    assert!(records[0].is_sse);
    assert_eq!(records[0].response_status, 200);
    assert_eq!(records[0].sse_message_count, 3);

    let counters = harness.state.admission.bank().snapshot();
    assert_eq!(counters.active_sse, 0, "sse slot released at stream end");
}

#[tokio::test]
async fn test_sse_idle_timeout_emits_termination_frame() {
    let harness = Harness::start(overrides(&[("sse.idle_timeout", json!(1))])).await;
    let key = harness.create_key(Priority::Normal).await;

    let started = Instant::now();
    let response =
        get_stream(&harness, "/api/stream?count=2&interval_ms=50&stall=true", &key).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.expect("stream ends when the proxy cuts it");
    let elapsed = started.elapsed();

    assert!(body.starts_with("data: msg-0\n\ndata: msg-1\n\n"));
    assert!(body.ends_with(
        "event: pylon_error\ndata: {\"code\":\"idle_timeout\",\"message\":\"No data received for 1 seconds\"}\n\n"
    ));
    assert!(elapsed >= Duration::from_secs(1), "cut no earlier than the idle timeout");
    assert!(elapsed < Duration::from_secs(5), "cut promptly after the idle timeout");

    let records = harness.wait_for_records(1).await;
    assert!(records[0].is_sse);
    assert_eq!(records[0].sse_message_count, 2);

    let counters = harness.state.admission.bank().snapshot();
    assert_eq!(counters.active_sse, 0, "sse gauge returns to its prior value");
}

#[tokio::test]
async fn test_sse_message_cap_terminates_stream() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.default_user",
        json!({"max_requests_per_minute": 5, "max_sse_connections": 2}),
    )]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    let response = get_stream(&harness, "/api/stream?count=10&interval_ms=10", &key).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.expect("stream ends when the proxy cuts it");
    assert!(body.contains("data: msg-4\n\n"), "the first five messages pass");
    assert!(!body.contains("data: msg-5"), "the sixth message is withheld");
    assert!(body.ends_with(
        "event: pylon_error\ndata: {\"code\":\"rate_limit_exceeded\",\"message\":\"Message rate limit exceeded\"}\n\n"
    ));

    let records = harness.wait_for_records(1).await;
    assert!(records[0].is_sse);
    assert_eq!(records[0].sse_message_count, 5, "only forwarded messages are counted");
}

#[tokio::test]
async fn test_downstream_event_stream_without_client_hint() {
    let harness = Harness::start(overrides(&[])).await;
    let key = harness.create_key(Priority::Normal).await;

    // No Accept header: admitted as unary, but the downstream responds with
    // an event stream, so the response is treated as SSE anyway.
    let response = harness.get("/api/stream?count=2&interval_ms=10", &key).await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("stream ends cleanly");
    assert_eq!(body, "data: msg-0\n\ndata: msg-1\n\n");

    let records = harness.wait_for_records(1).await;
    assert!(!records[0].is_sse, "the ticket kept its admission-time kind");
    assert_eq!(records[0].sse_message_count, 2, "messages still hit the shared window");

    let counters = harness.state.admission.bank().snapshot();
    assert_eq!(counters.active_unary, 0);
    assert_eq!(counters.active_sse, 0);
}

#[tokio::test]
async fn test_sse_connection_cap_blocks_second_stream() {
    let harness = Harness::start(overrides(&[
        (
            "rate_limit.default_user",
            json!({"max_sse_connections": 1, "max_requests_per_minute": 600}),
        ),
        ("queue.timeout", json!(1)),
    ]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    // Hold one stream open.
    let held = get_stream(&harness, "/api/stream?count=1&interval_ms=10&stall=true", &key).await;
    assert_eq!(held.status(), 200);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = get_stream(&harness, "/api/stream?count=1", &key).await;
    assert_eq!(response.status(), 504, "second stream waits for an sse slot, then times out");
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "queue_timeout");

    drop(held);
}

#[tokio::test]
async fn test_sse_messages_share_rpm_budget_with_unary() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.default_user",
        json!({"max_requests_per_minute": 5, "max_sse_connections": 2}),
    )]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    // Two unary requests consume two window events...
    for _ in 0..2 {
        assert_eq!(harness.get("/api/hello", &key).await.status(), 200);
    }

    // ...leaving room for three SSE messages before the cut.
    let response = get_stream(&harness, "/api/stream?count=10&interval_ms=10", &key).await;
    let body = response.text().await.expect("stream ends when the proxy cuts it");
    assert!(body.contains("data: msg-2\n\n"), "three messages fit the remaining budget");
    assert!(!body.contains("data: msg-3"), "the fourth message exceeds N+M");
    assert!(body.contains("\"code\":\"rate_limit_exceeded\""));

    let records = harness.wait_for_records(3).await;
    let sse_record = records.iter().find(|r| r.is_sse).expect("sse record exists");
    assert_eq!(sse_record.sse_message_count, 3);
}
