//! End-to-end scenarios for the unary proxy path.

use crate::harness::{overrides, Harness};
use pylon_core::auth::api_key::Priority;
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_health_is_unauthenticated() {
    let harness = Harness::start(overrides(&[])).await;

    let response = harness
        .client
        .get(harness.proxy("/health"))
        .send()
        .await
        .expect("health request should succeed");
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.expect("health body is json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["downstream"], "ok");
    assert_eq!(body["queue_size"], 0);
    assert_eq!(body["active_connections"], 0);
}

#[tokio::test]
async fn test_missing_credential_is_401() {
    let harness = Harness::start(overrides(&[])).await;

    let response = harness
        .client
        .get(harness.proxy("/api/hello"))
        .send()
        .await
        .expect("request should reach the proxy");
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_invalid_credential_is_401() {
    let harness = Harness::start(overrides(&[])).await;

    let response = harness.get("/api/hello", "sk-00000000000000000000000000000000").await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_revoked_credential_is_401() {
    let harness = Harness::start(overrides(&[])).await;
    let (key, record) = harness
        .state
        .keystore
        .create("revoked".to_string(), Priority::Normal, None, None)
        .await
        .expect("create should succeed");
    harness.state.keystore.revoke(&record.id).await.expect("revoke should succeed");

    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["message"], "API key revoked");
}

#[tokio::test]
async fn test_happy_unary_roundtrip() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.default_user",
        json!({"max_concurrent": 10, "max_requests_per_minute": 60}),
    )]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["message"], "hello");

    let records = harness.wait_for_records(1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].api_identifier, "GET /api/hello");
    assert_eq!(records[0].response_status, 200);
    assert!(!records[0].is_sse);
    assert_eq!(records[0].sse_message_count, 0);
}

#[tokio::test]
async fn test_downstream_error_status_passes_through() {
    let harness = Harness::start(overrides(&[])).await;
    let key = harness.create_key(Priority::Normal).await;

    let response = harness.get("/api/error", &key).await;
    assert_eq!(response.status(), 500, "downstream status is transparent");
}

#[tokio::test]
async fn test_unreachable_downstream_is_502() {
    // Point the proxy at a port nobody listens on.
    let harness = Harness::start(overrides(&[])).await;
    let mut items = std::collections::HashMap::new();
    items.insert(
        "downstream.base_url".to_string(),
        json!("http://127.0.0.1:9".to_string()),
    );
    harness.state.policy_store.set_many(&items).await.expect("policy update");
    let key = harness.create_key(Priority::Normal).await;

    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "downstream_error");

    let records = harness.wait_for_records(1).await;
    assert_eq!(records[0].response_status, 502);
}

#[tokio::test]
async fn test_hop_by_hop_and_credentials_stripped() {
    let harness = Harness::start(overrides(&[])).await;
    let key = harness.create_key(Priority::Normal).await;

    let response = harness
        .client
        .get(harness.proxy("/api/echo-headers"))
        .bearer_auth(&key)
        .header("x-custom", "survives")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.expect("body is json");
    let names: Vec<String> = body["header_names"]
        .as_array()
        .expect("header_names is an array")
        .iter()
        .map(|v| v.as_str().unwrap_or_default().to_string())
        .collect();

    assert!(names.contains(&"x-custom".to_string()), "end-to-end headers pass through");
    assert!(!names.contains(&"authorization".to_string()), "credential must not leak");
}

#[tokio::test]
async fn test_user_rpm_block_after_cap() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.default_user",
        json!({"max_concurrent": 10, "max_requests_per_minute": 10}),
    )]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    for i in 0..10 {
        let response = harness.get("/api/hello", &key).await;
        assert_eq!(response.status(), 200, "request {i} should pass");
    }

    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 429, "request 11 must hit the user cap");
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "user_limit");
}

#[tokio::test]
async fn test_api_rate_cap_names_api_limit() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.apis",
        json!({"GET /api/hello": {"max_requests_per_minute": 2}}),
    )]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    for _ in 0..2 {
        assert_eq!(harness.get("/api/hello", &key).await.status(), 200);
    }
    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "api_limit");

    // Other APIs are unaffected by that bucket.
    assert_eq!(harness.get("/api/slow?ms=1", &key).await.status(), 200);
}

#[tokio::test]
async fn test_per_key_override_beats_default() {
    let harness = Harness::start(overrides(&[(
        "rate_limit.default_user",
        json!({"max_requests_per_minute": 1000}),
    )]))
    .await;
    let key = harness
        .create_key_with_overrides(
            Priority::Normal,
            Some(pylon_core::policy::LimitRule {
                max_concurrent: None,
                max_requests_per_minute: Some(1),
                max_sse_connections: None,
            }),
        )
        .await;

    assert_eq!(harness.get("/api/hello", &key).await.status(), 200);
    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 429, "the override caps this key at one rpm");
}

#[tokio::test]
async fn test_concurrency_overflow_waits_in_queue() {
    let harness = Harness::start(overrides(&[
        (
            "rate_limit.default_user",
            json!({"max_concurrent": 2, "max_requests_per_minute": 600}),
        ),
        ("queue.max_size", json!(5)),
        ("queue.timeout", json!(30)),
    ]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let client = harness.client.clone();
        let url = harness.proxy("/api/slow?ms=700");
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let response = client
                .get(url)
                .bearer_auth(key)
                .send()
                .await
                .expect("request should succeed");
            (response.status().as_u16(), Instant::now())
        }));
    }

    let mut finished = Vec::new();
    for task in tasks {
        finished.push(task.await.expect("task should not panic"));
    }

    for (status, _) in &finished {
        assert_eq!(*status, 200, "all three requests are eventually served");
    }

    // Two run immediately, the third holds a queue slot for one service
    // time: total wall clock is at least two service times.
    let latest = finished.iter().map(|(_, at)| *at).max().expect("three results");
    assert!(
        latest.duration_since(started) >= Duration::from_millis(1200),
        "third request should have waited for a slot"
    );
}

#[tokio::test]
async fn test_queue_timeout_is_504() {
    let harness = Harness::start(overrides(&[
        ("rate_limit.default_user", json!({"max_concurrent": 1})),
        ("queue.max_size", json!(5)),
        ("queue.timeout", json!(1)),
    ]))
    .await;
    let key = harness.create_key(Priority::Normal).await;

    // Occupy the only slot well past the queue timeout.
    let blocker = {
        let client = harness.client.clone();
        let url = harness.proxy("/api/slow?ms=3000");
        let key = key.clone();
        tokio::spawn(async move { client.get(url).bearer_auth(key).send().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = harness.get("/api/hello", &key).await;
    assert_eq!(response.status(), 504);
    let body: serde_json::Value = response.json().await.expect("body is json");
    assert_eq!(body["code"], "queue_timeout");

    blocker.abort();
}

#[tokio::test]
async fn test_high_priority_preempts_queued_normal() {
    let harness = Harness::start(overrides(&[
        ("rate_limit.global", json!({"max_concurrent": 1, "max_sse_connections": 20})),
        ("rate_limit.default_user", json!({})),
        ("queue.max_size", json!(1)),
        ("queue.timeout", json!(10)),
    ]))
    .await;
    let normal_key = harness.create_key(Priority::Normal).await;
    let high_key = harness.create_key(Priority::High).await;

    // A occupies the single global slot.
    let blocker = {
        let client = harness.client.clone();
        let url = harness.proxy("/api/slow?ms=1500");
        let key = normal_key.clone();
        tokio::spawn(async move {
            client.get(url).bearer_auth(key).send().await.expect("request should succeed")
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // B waits in the queue of size one.
    let victim = {
        let client = harness.client.clone();
        let url = harness.proxy("/api/hello");
        let key = normal_key.clone();
        tokio::spawn(async move {
            client.get(url).bearer_auth(key).send().await.expect("request should succeed")
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // C (high priority) evicts B and takes its seat.
    let vip = {
        let client = harness.client.clone();
        let url = harness.proxy("/api/hello");
        let key = high_key.clone();
        tokio::spawn(async move {
            client.get(url).bearer_auth(key).send().await.expect("request should succeed")
        })
    };

    let victim_response = victim.await.expect("victim task should not panic");
    assert_eq!(victim_response.status(), 503, "the queued normal request is evicted");
    let body: serde_json::Value = victim_response.json().await.expect("body is json");
    assert_eq!(body["code"], "preempted");

    let vip_response = vip.await.expect("vip task should not panic");
    assert_eq!(vip_response.status(), 200, "the high-priority request is served");

    let blocker_response = blocker.await.expect("blocker task should not panic");
    assert_eq!(blocker_response.status(), 200);
}

#[tokio::test]
async fn test_gauges_return_to_zero_after_traffic() {
    let harness = Harness::start(overrides(&[])).await;
    let key = harness.create_key(Priority::Normal).await;

    for _ in 0..5 {
        let response = harness.get("/api/hello", &key).await;
        assert_eq!(response.status(), 200);
        response.text().await.expect("body should be readable");
    }

    // A persisted record means its request finalized, and finalization
    // releases the ticket first.
    harness.wait_for_records(5).await;
    let counters = harness.state.admission.bank().snapshot();
    assert_eq!(counters.active_unary, 0);
    assert_eq!(counters.active_sse, 0);
    assert_eq!(harness.state.admission.queue().len(), 0);
}
