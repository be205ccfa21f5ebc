use super::{
    api_key::{ApiKey, Priority},
    AuthError,
};
use crate::policy::LimitRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Counts of keys by lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct KeyCounts {
    pub total: i64,
    pub active: i64,
    pub expired: i64,
    pub revoked: i64,
}

/// Metadata fields an admin may change on an existing key. `None` leaves the
/// field untouched.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub limit_overrides: Option<Option<LimitRule>>,
}

/// Repository trait for API key storage.
///
/// Abstracts the backing store so the admission path can be tested against
/// mock implementations.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Looks up a key by the hash of the presented credential. Returns
    /// revoked and expired rows too; validity is the caller's decision.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, AuthError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ApiKey>, AuthError>;

    async fn insert(&self, key: &ApiKey) -> Result<(), AuthError>;

    async fn list(
        &self,
        include_revoked: bool,
        include_expired: bool,
    ) -> Result<Vec<ApiKey>, AuthError>;

    async fn update_metadata(
        &self,
        id: &str,
        update: KeyUpdate,
    ) -> Result<Option<ApiKey>, AuthError>;

    async fn set_revoked(
        &self,
        id: &str,
        revoked_at: DateTime<Utc>,
    ) -> Result<Option<ApiKey>, AuthError>;

    /// Atomically replaces the stored hash and display prefix.
    async fn replace_credential(
        &self,
        id: &str,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<Option<ApiKey>, AuthError>;

    /// Removes the row. Lifecycle guarding (revoked/expired only) is done by
    /// the caller.
    async fn delete(&self, id: &str) -> Result<bool, AuthError>;

    async fn counts(&self) -> Result<KeyCounts, AuthError>;
}

pub struct SqliteKeyRepository {
    pool: SqlitePool,
}

impl SqliteKeyRepository {
    /// Creates the repository and its schema.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Database`] if schema creation fails.
    pub async fn new(pool: SqlitePool) -> Result<Self, AuthError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                priority TEXT NOT NULL DEFAULT 'normal',
                created_at TIMESTAMP NOT NULL,
                expires_at TIMESTAMP,
                revoked_at TIMESTAMP,
                limit_overrides TEXT
            )
            ",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys(key_hash)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, AuthError> {
        let priority_raw: String = row.try_get("priority").map_err(sqlx_column)?;
        let priority = Priority::parse(&priority_raw).ok_or_else(|| {
            AuthError::Database(format!("unknown priority value '{priority_raw}'"))
        })?;

        let overrides_raw: Option<String> = row.try_get("limit_overrides").map_err(sqlx_column)?;
        let limit_overrides = overrides_raw
            .as_deref()
            .map(serde_json::from_str::<LimitRule>)
            .transpose()
            .map_err(|e| AuthError::Database(format!("limit_overrides: {e}")))?;

        Ok(ApiKey {
            id: row.try_get("id").map_err(sqlx_column)?,
            key_hash: row.try_get("key_hash").map_err(sqlx_column)?,
            key_prefix: row.try_get("key_prefix").map_err(sqlx_column)?,
            description: row.try_get("description").map_err(sqlx_column)?,
            priority,
            created_at: row.try_get("created_at").map_err(sqlx_column)?,
            expires_at: row.try_get("expires_at").map_err(sqlx_column)?,
            revoked_at: row.try_get("revoked_at").map_err(sqlx_column)?,
            limit_overrides,
        })
    }
}

fn sqlx_column(e: sqlx::Error) -> AuthError {
    AuthError::Database(e.to_string())
}

const SELECT_COLUMNS: &str = "id, key_hash, key_prefix, description, priority, \
     created_at, expires_at, revoked_at, limit_overrides";

#[async_trait]
impl KeyRepository for SqliteKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, AuthError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys WHERE key_hash = ?"
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_api_key(&r)).transpose()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ApiKey>, AuthError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM api_keys WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_api_key(&r)).transpose()
    }

    async fn insert(&self, key: &ApiKey) -> Result<(), AuthError> {
        let overrides = key
            .limit_overrides
            .map(|o| serde_json::to_string(&o))
            .transpose()
            .map_err(|e| AuthError::Database(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO api_keys (id, key_hash, key_prefix, description, priority,
                                  created_at, expires_at, revoked_at, limit_overrides)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.description)
        .bind(key.priority.as_str())
        .bind(key.created_at)
        .bind(key.expires_at)
        .bind(key.revoked_at)
        .bind(overrides)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(
        &self,
        include_revoked: bool,
        include_expired: bool,
    ) -> Result<Vec<ApiKey>, AuthError> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM api_keys WHERE 1 = 1");
        if !include_revoked {
            sql.push_str(" AND revoked_at IS NULL");
        }
        if !include_expired {
            sql.push_str(" AND (expires_at IS NULL OR expires_at > ?)");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        if !include_expired {
            query = query.bind(Utc::now());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_api_key).collect()
    }

    async fn update_metadata(
        &self,
        id: &str,
        update: KeyUpdate,
    ) -> Result<Option<ApiKey>, AuthError> {
        if let Some(description) = update.description {
            sqlx::query("UPDATE api_keys SET description = ? WHERE id = ?")
                .bind(description)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(priority) = update.priority {
            sqlx::query("UPDATE api_keys SET priority = ? WHERE id = ?")
                .bind(priority.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(expires_at) = update.expires_at {
            sqlx::query("UPDATE api_keys SET expires_at = ? WHERE id = ?")
                .bind(expires_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(overrides) = update.limit_overrides {
            let raw = overrides
                .map(|o| serde_json::to_string(&o))
                .transpose()
                .map_err(|e| AuthError::Database(e.to_string()))?;
            sqlx::query("UPDATE api_keys SET limit_overrides = ? WHERE id = ?")
                .bind(raw)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        self.find_by_id(id).await
    }

    async fn set_revoked(
        &self,
        id: &str,
        revoked_at: DateTime<Utc>,
    ) -> Result<Option<ApiKey>, AuthError> {
        sqlx::query("UPDATE api_keys SET revoked_at = ? WHERE id = ?")
            .bind(revoked_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.find_by_id(id).await
    }

    async fn replace_credential(
        &self,
        id: &str,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<Option<ApiKey>, AuthError> {
        sqlx::query("UPDATE api_keys SET key_hash = ?, key_prefix = ? WHERE id = ?")
            .bind(key_hash)
            .bind(key_prefix)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.find_by_id(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, AuthError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<KeyCounts, AuthError> {
        let now = Utc::now();

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_keys")
            .fetch_one(&self.pool)
            .await?;

        let active: i64 = sqlx::query_scalar(
            r"
            SELECT COUNT(*) FROM api_keys
            WHERE revoked_at IS NULL AND (expires_at IS NULL OR expires_at > ?)
            ",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let expired: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_keys WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let revoked: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE revoked_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(KeyCounts { total, active, expired, revoked })
    }
}
