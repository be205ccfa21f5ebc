//! Boots the full proxy stack in-process for one test.

use pylon_core::{auth::api_key::Priority, config::AppConfig, policy::LimitRule};
use server::{admin, proxy_app, AppState};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, net::SocketAddr, time::Duration};

pub const ADMIN_PASSWORD: &str = "e2e-admin-password";

pub struct Harness {
    pub state: AppState,
    pub proxy_url: String,
    pub admin_url: String,
    pub downstream: SocketAddr,
    pub client: reqwest::Client,
}

impl Harness {
    /// Starts the mock downstream, the proxy, and the admin server, and
    /// applies the given flat policy overrides on top of defaults. The
    /// downstream address is wired in automatically.
    pub async fn start(policy_overrides: HashMap<String, serde_json::Value>) -> Self {
        let downstream = crate::mock_downstream::spawn().await;

        // One connection: every handle must see the same in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(sqlx::sqlite::SqliteConnectOptions::new().in_memory(true))
            .await
            .expect("in-memory pool should connect");

        let mut config = AppConfig::default();
        config.admin.password_hash = hex::encode(Sha256::digest(ADMIN_PASSWORD.as_bytes()));
        config.admin.token_secret = "e2e-token-secret".to_string();

        let state = AppState::initialize(&config, pool).await.expect("state should initialize");
        state.spawn_workers();

        let mut items = policy_overrides;
        items.insert(
            "downstream.base_url".to_string(),
            serde_json::json!(format!("http://{downstream}")),
        );
        state.policy_store.set_many(&items).await.expect("policy overrides should apply");

        let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("proxy should bind an ephemeral port");
        let proxy_addr = proxy_listener.local_addr().expect("listener has an address");
        let proxy_router = proxy_app::router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                proxy_listener,
                proxy_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("proxy serve should not fail");
        });

        let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("admin should bind an ephemeral port");
        let admin_addr = admin_listener.local_addr().expect("listener has an address");
        let admin_router = admin::router(state.clone());
        tokio::spawn(async move {
            axum::serve(admin_listener, admin_router)
                .await
                .expect("admin serve should not fail");
        });

        // Ambient proxy variables must not intercept loopback traffic.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("test client should build");

        Self {
            state,
            proxy_url: format!("http://{proxy_addr}"),
            admin_url: format!("http://{admin_addr}"),
            downstream,
            client,
        }
    }

    /// Creates an API key and returns its plaintext credential.
    pub async fn create_key(&self, priority: Priority) -> String {
        self.create_key_with_overrides(priority, None).await
    }

    pub async fn create_key_with_overrides(
        &self,
        priority: Priority,
        overrides: Option<LimitRule>,
    ) -> String {
        let (plaintext, _) = self
            .state
            .keystore
            .create("e2e".to_string(), priority, None, overrides)
            .await
            .expect("key creation should succeed");
        plaintext
    }

    pub fn proxy(&self, path: &str) -> String {
        format!("{}{}", self.proxy_url, path)
    }

    pub fn admin(&self, path: &str) -> String {
        format!("{}{}", self.admin_url, path)
    }

    pub async fn get(&self, path: &str, key: &str) -> reqwest::Response {
        self.client
            .get(self.proxy(path))
            .bearer_auth(key)
            .send()
            .await
            .expect("request should reach the proxy")
    }

    /// Logs in to the admin API and returns the bearer token.
    pub async fn admin_token(&self) -> String {
        let response = self
            .client
            .post(self.admin("/login"))
            .json(&serde_json::json!({ "password": ADMIN_PASSWORD }))
            .send()
            .await
            .expect("login request should reach the admin server");
        assert_eq!(response.status(), 200, "login should succeed");
        let body: serde_json::Value = response.json().await.expect("login body is json");
        body["token"].as_str().expect("token is a string").to_string()
    }

    /// Waits until the flush worker has persisted `count` request-log rows.
    pub async fn wait_for_records(&self, count: i64) -> Vec<RecordRow> {
        for _ in 0..100 {
            let rows = self.records().await;
            if rows.len() as i64 >= count {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} request log records, got {:?}", self.records().await);
    }

    pub async fn records(&self) -> Vec<RecordRow> {
        sqlx::query_as::<_, RecordRow>(
            r"
            SELECT api_key_id, api_identifier, response_status, is_sse, sse_message_count
            FROM request_logs ORDER BY id
            ",
        )
        .fetch_all(&self.state.pool)
        .await
        .expect("request_logs query should succeed")
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RecordRow {
    pub api_key_id: String,
    pub api_identifier: String,
    pub response_status: i64,
    pub is_sse: bool,
    pub sse_message_count: i64,
}

/// Convenience constructor for flat policy override maps.
pub fn overrides(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}
