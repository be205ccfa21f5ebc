//! Dynamic, hot-reloadable policy.
//!
//! Policy is everything tunable at runtime: the downstream address, rate and
//! concurrency caps, queue sizing, SSE idle timeout, and log retention. It is
//! persisted as flat dotted keys with JSON values in the `policies` table and
//! exposed to the request path as an immutable [`PolicySnapshot`] behind an
//! atomically swappable reference.
//!
//! Each request loads the snapshot exactly once at entry and uses that value
//! throughout, so a concurrent policy write never changes decisions already
//! taken. Writers persist the new values, rebuild the snapshot from the
//! store, and [`store`](arc_swap::ArcSwap::store) it — readers are lock-free.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("unknown policy key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Caps applied on one dimension (global, per identity, or per API).
///
/// `None` means unlimited on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default)]
    pub max_sse_connections: Option<u32>,
}

/// An API route pattern with an attached rate rule.
///
/// Patterns look like `"GET /users/{id}"` or `"POST /v1/chat/*"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiPattern {
    pub pattern: String,
    pub rule: LimitRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamPolicy {
    pub base_url: String,
    /// Downstream request deadline in seconds.
    pub timeout: u64,
}

impl DownstreamPolicy {
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(rename = "global")]
    pub global_limit: LimitRule,
    pub default_user: LimitRule,
    /// Exact API identifiers (`"METHOD /path"`) with dedicated rate rules.
    pub apis: HashMap<String, LimitRule>,
    /// Ordered route patterns; the first match names the API identifier.
    pub api_patterns: Vec<ApiPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub max_size: usize,
    /// Maximum queue wait in seconds.
    pub timeout: u64,
}

impl QueuePolicy {
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsePolicy {
    /// Seconds without a downstream byte before the stream is cut.
    pub idle_timeout: u64,
}

impl SsePolicy {
    #[must_use]
    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Request log rows older than this many days are swept.
    pub days: u32,
    pub cleanup_interval_hours: u64,
}

/// A consistent, immutable view of the whole policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub downstream: DownstreamPolicy,
    pub rate_limit: RateLimitPolicy,
    pub queue: QueuePolicy,
    pub sse: SsePolicy,
    pub data_retention: RetentionPolicy,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            downstream: DownstreamPolicy { base_url: String::new(), timeout: 30 },
            rate_limit: RateLimitPolicy {
                global_limit: LimitRule {
                    max_concurrent: Some(50),
                    max_requests_per_minute: Some(500),
                    max_sse_connections: Some(20),
                },
                default_user: LimitRule {
                    max_concurrent: Some(4),
                    max_requests_per_minute: Some(60),
                    max_sse_connections: Some(2),
                },
                apis: HashMap::new(),
                api_patterns: Vec::new(),
            },
            queue: QueuePolicy { max_size: 100, timeout: 30 },
            sse: SsePolicy { idle_timeout: 60 },
            data_retention: RetentionPolicy { days: 30, cleanup_interval_hours: 24 },
        }
    }
}

/// The flat keys under which policy is persisted.
const POLICY_KEYS: &[&str] = &[
    "downstream.base_url",
    "downstream.timeout",
    "rate_limit.global",
    "rate_limit.default_user",
    "rate_limit.apis",
    "rate_limit.api_patterns",
    "queue.max_size",
    "queue.timeout",
    "sse.idle_timeout",
    "data_retention.days",
    "data_retention.cleanup_interval_hours",
];

impl PolicySnapshot {
    /// Builds a snapshot from flat key/value pairs, starting from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownKey`] for a key outside [`POLICY_KEYS`]
    /// and [`PolicyError::InvalidValue`] when a value does not deserialize
    /// into the key's shape.
    pub fn from_entries(entries: &HashMap<String, Value>) -> Result<Self, PolicyError> {
        let mut snapshot = Self::default();
        for (key, value) in entries {
            snapshot.apply(key, value)?;
        }
        Ok(snapshot)
    }

    fn apply(&mut self, key: &str, value: &Value) -> Result<(), PolicyError> {
        fn parse<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T, PolicyError> {
            serde_json::from_value(value.clone()).map_err(|e| PolicyError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }

        match key {
            "downstream.base_url" => self.downstream.base_url = parse(key, value)?,
            "downstream.timeout" => self.downstream.timeout = parse(key, value)?,
            "rate_limit.global" => self.rate_limit.global_limit = parse(key, value)?,
            "rate_limit.default_user" => self.rate_limit.default_user = parse(key, value)?,
            "rate_limit.apis" => self.rate_limit.apis = parse(key, value)?,
            "rate_limit.api_patterns" => self.rate_limit.api_patterns = parse(key, value)?,
            "queue.max_size" => self.queue.max_size = parse(key, value)?,
            "queue.timeout" => self.queue.timeout = parse(key, value)?,
            "sse.idle_timeout" => self.sse.idle_timeout = parse(key, value)?,
            "data_retention.days" => self.data_retention.days = parse(key, value)?,
            "data_retention.cleanup_interval_hours" => {
                self.data_retention.cleanup_interval_hours = parse(key, value)?;
            }
            other => return Err(PolicyError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Serializes the snapshot back into its flat persisted form.
    #[must_use]
    pub fn to_entries(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        out.insert("downstream.base_url".into(), Value::from(self.downstream.base_url.clone()));
        out.insert("downstream.timeout".into(), Value::from(self.downstream.timeout));
        out.insert(
            "rate_limit.global".into(),
            serde_json::to_value(self.rate_limit.global_limit).unwrap_or(Value::Null),
        );
        out.insert(
            "rate_limit.default_user".into(),
            serde_json::to_value(self.rate_limit.default_user).unwrap_or(Value::Null),
        );
        out.insert(
            "rate_limit.apis".into(),
            serde_json::to_value(&self.rate_limit.apis).unwrap_or(Value::Null),
        );
        out.insert(
            "rate_limit.api_patterns".into(),
            serde_json::to_value(&self.rate_limit.api_patterns).unwrap_or(Value::Null),
        );
        out.insert("queue.max_size".into(), Value::from(self.queue.max_size));
        out.insert("queue.timeout".into(), Value::from(self.queue.timeout));
        out.insert("sse.idle_timeout".into(), Value::from(self.sse.idle_timeout));
        out.insert("data_retention.days".into(), Value::from(self.data_retention.days));
        out.insert(
            "data_retention.cleanup_interval_hours".into(),
            Value::from(self.data_retention.cleanup_interval_hours),
        );
        out
    }
}

/// Read side of the policy: a lock-free, atomically swappable snapshot.
pub struct PolicyHandle {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyHandle {
    #[must_use]
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self { current: ArcSwap::from_pointee(snapshot) }
    }

    /// Returns the current snapshot. Callers hold the returned `Arc` for the
    /// whole request so a mid-request reload cannot tear their view.
    #[must_use]
    pub fn load(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    fn install(&self, snapshot: PolicySnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(PolicySnapshot::default())
    }
}

/// Write side of the policy: durable storage plus snapshot rebuilds.
pub struct PolicyStore {
    pool: SqlitePool,
    handle: Arc<PolicyHandle>,
}

impl PolicyStore {
    /// Opens the store, seeding defaults when the table is empty, and
    /// installs the initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Database`] if schema creation or the initial
    /// load fails.
    pub async fn open(pool: SqlitePool) -> Result<Self, PolicyError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS policies (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        let store = Self { pool, handle: Arc::new(PolicyHandle::default()) };
        if store.is_empty().await? {
            store.seed_defaults().await?;
            tracing::info!("initialized default policy values");
        }
        store.reload().await?;
        Ok(store)
    }

    /// Returns the shared read handle.
    #[must_use]
    pub fn handle(&self) -> Arc<PolicyHandle> {
        Arc::clone(&self.handle)
    }

    async fn is_empty(&self) -> Result<bool, PolicyError> {
        let row = sqlx::query("SELECT key FROM policies LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_none())
    }

    async fn seed_defaults(&self) -> Result<(), PolicyError> {
        let defaults = PolicySnapshot::default().to_entries();
        for key in POLICY_KEYS {
            let value = defaults.get(*key).cloned().unwrap_or(Value::Null);
            self.upsert(key, &value).await?;
        }
        Ok(())
    }

    async fn upsert(&self, key: &str, value: &Value) -> Result<(), PolicyError> {
        sqlx::query(
            r"
            INSERT INTO policies (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads every persisted key as a flat map.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Database`] on query failure.
    pub async fn get_all(&self) -> Result<HashMap<String, Value>, PolicyError> {
        let rows = sqlx::query("SELECT key, value FROM policies")
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value");
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    out.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unparseable policy row");
                }
            }
        }
        Ok(out)
    }

    /// Persists the given keys and atomically installs the rebuilt snapshot.
    ///
    /// Validation happens before anything is written: an unknown key or a
    /// value of the wrong shape rejects the whole update.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownKey`] / [`PolicyError::InvalidValue`]
    /// for bad input, [`PolicyError::Database`] on write failure.
    pub async fn set_many(&self, items: &HashMap<String, Value>) -> Result<(), PolicyError> {
        // Dry-run against the current state so a torn update never lands.
        let mut merged = self.get_all().await?;
        for (key, value) in items {
            if !POLICY_KEYS.contains(&key.as_str()) {
                return Err(PolicyError::UnknownKey(key.clone()));
            }
            merged.insert(key.clone(), value.clone());
        }
        PolicySnapshot::from_entries(&merged)?;

        for (key, value) in items {
            self.upsert(key, value).await?;
        }
        self.reload().await
    }

    /// Rebuilds the snapshot from storage and swaps it in.
    async fn reload(&self) -> Result<(), PolicyError> {
        let entries = self.get_all().await?;
        let snapshot = PolicySnapshot::from_entries(&entries)?;
        self.handle.install(snapshot);
        Ok(())
    }
}
