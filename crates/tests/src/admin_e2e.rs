//! End-to-end tests for the management API.

use crate::harness::{overrides, Harness, ADMIN_PASSWORD};
use pylon_core::auth::api_key::Priority;
use serde_json::json;

#[tokio::test]
async fn test_login_and_rejections() {
    let harness = Harness::start(overrides(&[])).await;

    let ok = harness
        .client
        .post(harness.admin("/login"))
        .json(&json!({ "password": ADMIN_PASSWORD }))
        .send()
        .await
        .expect("login request should succeed");
    assert_eq!(ok.status(), 200);
    let body: serde_json::Value = ok.json().await.expect("body is json");
    assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(body["expires_at"].as_str().is_some());

    let wrong = harness
        .client
        .post(harness.admin("/login"))
        .json(&json!({ "password": "nope" }))
        .send()
        .await
        .expect("login request should succeed");
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let harness = Harness::start(overrides(&[])).await;

    for path in ["/api-keys", "/policy", "/monitor", "/stats/summary"] {
        let response = harness
            .client
            .get(harness.admin(path))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), 401, "{path} must be protected");
    }

    let bad_token = harness
        .client
        .get(harness.admin("/api-keys"))
        .bearer_auth("made-up-token")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(bad_token.status(), 401);

    // Health stays open for liveness probes.
    let health = harness
        .client
        .get(harness.admin("/health"))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_key_lifecycle_over_http() {
    let harness = Harness::start(overrides(&[])).await;
    let token = harness.admin_token().await;

    // Create.
    let created = harness
        .client
        .post(harness.admin("/api-keys"))
        .bearer_auth(&token)
        .json(&json!({ "description": "ci bot", "priority": "high" }))
        .send()
        .await
        .expect("create should succeed");
    assert_eq!(created.status(), 201);
    let created: serde_json::Value = created.json().await.expect("body is json");
    let plaintext = created["key"].as_str().expect("plaintext key is returned").to_string();
    let id = created["api_key"]["id"].as_str().expect("id is present").to_string();
    assert!(plaintext.starts_with("sk-"));
    assert_eq!(created["api_key"]["priority"], "high");
    assert!(created["api_key"].get("key_hash").is_none(), "the hash never leaves the server");

    // The fresh key works against the proxy.
    assert_eq!(harness.get("/api/hello", &plaintext).await.status(), 200);

    // List and fetch.
    let listed: serde_json::Value = harness
        .client
        .get(harness.admin("/api-keys"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("list should succeed")
        .json()
        .await
        .expect("body is json");
    assert!(listed.as_array().is_some_and(|keys| keys.len() == 1));

    // Update metadata.
    let updated: serde_json::Value = harness
        .client
        .put(harness.admin(format!("/api-keys/{id}").as_str()))
        .bearer_auth(&token)
        .json(&json!({ "description": "renamed", "priority": "low" }))
        .send()
        .await
        .expect("update should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(updated["description"], "renamed");
    assert_eq!(updated["priority"], "low");

    // Deleting an active key is refused.
    let premature = harness
        .client
        .delete(harness.admin(format!("/api-keys/{id}").as_str()))
        .bearer_auth(&token)
        .send()
        .await
        .expect("delete should get a response");
    assert_eq!(premature.status(), 409);

    // Revoke, then the key stops working and becomes deletable.
    let revoked = harness
        .client
        .post(harness.admin(format!("/api-keys/{id}/revoke").as_str()))
        .bearer_auth(&token)
        .send()
        .await
        .expect("revoke should succeed");
    assert_eq!(revoked.status(), 200);
    assert_eq!(harness.get("/api/hello", &plaintext).await.status(), 401);

    let deleted = harness
        .client
        .delete(harness.admin(format!("/api-keys/{id}").as_str()))
        .bearer_auth(&token)
        .send()
        .await
        .expect("delete should succeed");
    assert_eq!(deleted.status(), 204);

    let counts: serde_json::Value = harness
        .client
        .get(harness.admin("/api-keys/count"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("count should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(counts["total"], 0);
}

#[tokio::test]
async fn test_refresh_rotates_credential() {
    let harness = Harness::start(overrides(&[])).await;
    let token = harness.admin_token().await;
    let (old_key, record) = harness
        .state
        .keystore
        .create("rotating".to_string(), Priority::Normal, None, None)
        .await
        .expect("create should succeed");

    assert_eq!(harness.get("/api/hello", &old_key).await.status(), 200);

    let refreshed: serde_json::Value = harness
        .client
        .post(harness.admin(format!("/api-keys/{}/refresh", record.id).as_str()))
        .bearer_auth(&token)
        .send()
        .await
        .expect("refresh should succeed")
        .json()
        .await
        .expect("body is json");
    let new_key = refreshed["key"].as_str().expect("new key is returned").to_string();
    assert_ne!(new_key, old_key);

    assert_eq!(
        harness.get("/api/hello", &old_key).await.status(),
        401,
        "the previous credential is invalid once the response is out"
    );
    assert_eq!(harness.get("/api/hello", &new_key).await.status(), 200);
}

#[tokio::test]
async fn test_policy_read_and_hot_update() {
    let harness = Harness::start(overrides(&[])).await;
    let token = harness.admin_token().await;

    let policy: serde_json::Value = harness
        .client
        .get(harness.admin("/policy"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("policy read should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(policy["queue"]["max_size"], 100);

    let updated: serde_json::Value = harness
        .client
        .put(harness.admin("/policy"))
        .bearer_auth(&token)
        .json(&json!({ "queue.max_size": 42, "sse.idle_timeout": 7 }))
        .send()
        .await
        .expect("policy update should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(updated["queue"]["max_size"], 42);
    assert_eq!(updated["sse"]["idle_timeout"], 7);

    // The running snapshot switched too.
    assert_eq!(harness.state.policy.load().queue.max_size, 42);

    // Bad updates are rejected wholesale.
    let rejected = harness
        .client
        .put(harness.admin("/policy"))
        .bearer_auth(&token)
        .json(&json!({ "queue.depth": 1 }))
        .send()
        .await
        .expect("request should get a response");
    assert_eq!(rejected.status(), 400);
}

#[tokio::test]
async fn test_monitor_and_stats_after_traffic() {
    let harness = Harness::start(overrides(&[])).await;
    let token = harness.admin_token().await;
    let key = harness.create_key(Priority::Normal).await;

    for _ in 0..3 {
        assert_eq!(harness.get("/api/hello", &key).await.status(), 200);
    }
    harness.wait_for_records(3).await;

    let monitor: serde_json::Value = harness
        .client
        .get(harness.admin("/monitor"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("monitor should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(monitor["queue_size"], 0);
    assert_eq!(monitor["active_unary"], 0);
    assert_eq!(monitor["requests_last_minute"], 3);

    let summary: serde_json::Value = harness
        .client
        .get(harness.admin("/stats/summary"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("summary should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(summary["total_requests"], 3);
    assert_eq!(summary["error_requests"], 0);

    let users: serde_json::Value = harness
        .client
        .get(harness.admin("/stats/users"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("user stats should succeed")
        .json()
        .await
        .expect("body is json");
    let users = users.as_array().expect("array of identities");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["request_count"], 3);

    let apis: serde_json::Value = harness
        .client
        .get(harness.admin("/stats/apis"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("api stats should succeed")
        .json()
        .await
        .expect("body is json");
    assert_eq!(apis[0]["api_identifier"], "GET /api/hello");
}
