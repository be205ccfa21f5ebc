//! Aggregate queries over the request log, for the management API.
//!
//! These read the `request_logs` table the recorder writes; the proxy path
//! itself never reads them.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

/// Overall traffic summary for a time range.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_requests: i64,
    pub error_requests: i64,
    pub avg_response_time_ms: f64,
    pub sse_connections: i64,
    pub sse_messages: i64,
}

/// Per-identity traffic summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserStats {
    pub api_key_id: String,
    pub request_count: i64,
    pub error_count: i64,
    pub avg_response_time_ms: f64,
    pub sse_message_count: i64,
}

/// Per-API traffic summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiStats {
    pub api_identifier: String,
    pub request_count: i64,
    pub error_count: i64,
    pub avg_response_time_ms: f64,
}

/// Default window when the caller gives no range: the last 24 hours.
#[must_use]
pub fn default_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.unwrap_or_else(Utc::now);
    let start = start.unwrap_or(end - Duration::hours(24));
    (start, end)
}

/// # Errors
///
/// Returns the underlying [`sqlx::Error`] on query failure.
pub async fn summary(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<StatsSummary, sqlx::Error> {
    let row = sqlx::query(
        r"
        SELECT COUNT(*) AS total,
               COALESCE(SUM(CASE WHEN response_status >= 400 THEN 1 ELSE 0 END), 0) AS errors,
               COALESCE(AVG(response_time_ms), 0.0) AS avg_ms,
               COALESCE(SUM(CASE WHEN is_sse THEN 1 ELSE 0 END), 0) AS sse_connections,
               COALESCE(SUM(sse_message_count), 0) AS sse_messages
        FROM request_logs
        WHERE request_time >= ? AND request_time <= ?
        ",
    )
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await?;

    Ok(StatsSummary {
        start,
        end,
        total_requests: row.get("total"),
        error_requests: row.get("errors"),
        avg_response_time_ms: row.get("avg_ms"),
        sse_connections: row.get("sse_connections"),
        sse_messages: row.get("sse_messages"),
    })
}

/// # Errors
///
/// Returns the underlying [`sqlx::Error`] on query failure.
pub async fn by_user(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<UserStats>, sqlx::Error> {
    let rows = sqlx::query(
        r"
        SELECT api_key_id,
               COUNT(*) AS requests,
               COALESCE(SUM(CASE WHEN response_status >= 400 THEN 1 ELSE 0 END), 0) AS errors,
               COALESCE(AVG(response_time_ms), 0.0) AS avg_ms,
               COALESCE(SUM(sse_message_count), 0) AS sse_messages
        FROM request_logs
        WHERE request_time >= ? AND request_time <= ?
        GROUP BY api_key_id
        ORDER BY requests DESC
        ",
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| UserStats {
            api_key_id: row.get("api_key_id"),
            request_count: row.get("requests"),
            error_count: row.get("errors"),
            avg_response_time_ms: row.get("avg_ms"),
            sse_message_count: row.get("sse_messages"),
        })
        .collect())
}

/// # Errors
///
/// Returns the underlying [`sqlx::Error`] on query failure.
pub async fn by_api(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ApiStats>, sqlx::Error> {
    let rows = sqlx::query(
        r"
        SELECT api_identifier,
               COUNT(*) AS requests,
               COALESCE(SUM(CASE WHEN response_status >= 400 THEN 1 ELSE 0 END), 0) AS errors,
               COALESCE(AVG(response_time_ms), 0.0) AS avg_ms
        FROM request_logs
        WHERE request_time >= ? AND request_time <= ?
        GROUP BY api_identifier
        ORDER BY requests DESC
        ",
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ApiStats {
            api_identifier: row.get("api_identifier"),
            request_count: row.get("requests"),
            error_count: row.get("errors"),
            avg_response_time_ms: row.get("avg_ms"),
        })
        .collect())
}
