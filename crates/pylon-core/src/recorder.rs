//! Fire-and-forget completion records.
//!
//! Every finished request — served, rejected, failed, or cancelled — yields
//! exactly one [`RequestRecord`]. The hot path only appends to a bounded
//! in-memory buffer and never blocks on storage; when the buffer overflows,
//! the oldest entries are dropped and counted. A background worker drains
//! the buffer into the `request_logs` table: eventually flushed, not
//! transactional.
//!
//! A second background task sweeps rows older than the retention policy.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;

/// One completed request, as persisted to `request_logs`.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub api_key_id: String,
    /// `"METHOD path-or-pattern"` as derived at admission.
    pub api_identifier: String,
    pub request_path: String,
    pub request_method: String,
    pub response_status: u16,
    pub request_time: DateTime<Utc>,
    pub response_time_ms: i64,
    pub client_ip: String,
    pub is_sse: bool,
    pub sse_message_count: i64,
}

/// Status recorded when the client went away before a response existed.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

const FLUSH_BATCH: usize = 128;

pub struct Recorder {
    buffer: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Recorder {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Creates the `request_logs` table.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`sqlx::Error`] if schema creation fails.
    pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_id TEXT NOT NULL,
                api_identifier TEXT NOT NULL,
                request_path TEXT NOT NULL,
                request_method TEXT NOT NULL,
                response_status INTEGER NOT NULL,
                request_time TIMESTAMP NOT NULL,
                response_time_ms INTEGER NOT NULL,
                client_ip TEXT NOT NULL,
                is_sse BOOLEAN NOT NULL DEFAULT 0,
                sse_message_count INTEGER NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_request_logs_key ON request_logs(api_key_id)",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_api ON request_logs(api_identifier)",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_time ON request_logs(request_time)",
        ] {
            sqlx::query(index).execute(pool).await?;
        }
        Ok(())
    }

    /// Appends a record. Never blocks; evicts the oldest entry when full.
    pub fn record(&self, record: RequestRecord) {
        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(record);
            if buffer.len() > self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    /// Records dropped to overflow since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records buffered but not yet flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    fn drain_batch(&self) -> Vec<RequestRecord> {
        let mut buffer = self.buffer.lock();
        let take = buffer.len().min(FLUSH_BATCH);
        buffer.drain(..take).collect()
    }

    /// Writes everything currently buffered. Failed inserts are logged and
    /// the records are gone; durability here is best-effort by contract.
    pub async fn flush(&self, pool: &SqlitePool) {
        loop {
            let batch = self.drain_batch();
            if batch.is_empty() {
                return;
            }
            for record in batch {
                if let Err(e) = insert_record(pool, &record).await {
                    tracing::warn!(error = %e, "failed to persist request log record");
                }
            }
        }
    }

    /// Background worker: flush whenever records arrive.
    pub fn spawn_flush_worker(
        recorder: Arc<Self>,
        pool: SqlitePool,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                recorder.notify.notified().await;
                recorder.flush(&pool).await;
            }
        })
    }

    /// Background worker: delete rows older than the retention window, on
    /// the configured interval. Retention settings are re-read from the
    /// policy each cycle.
    pub fn spawn_retention_sweeper(
        pool: SqlitePool,
        policy: Arc<crate::policy::PolicyHandle>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let retention = policy.load().data_retention.clone();
                let interval = Duration::from_secs(retention.cleanup_interval_hours.max(1) * 3600);
                tokio::time::sleep(interval).await;

                let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention.days));
                match sqlx::query("DELETE FROM request_logs WHERE request_time < ?")
                    .bind(cutoff)
                    .execute(&pool)
                    .await
                {
                    Ok(result) if result.rows_affected() > 0 => {
                        tracing::info!(
                            deleted = result.rows_affected(),
                            retention_days = retention.days,
                            "swept old request log rows"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "request log retention sweep failed"),
                }
            }
        })
    }
}

async fn insert_record(pool: &SqlitePool, record: &RequestRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO request_logs (api_key_id, api_identifier, request_path, request_method,
                                  response_status, request_time, response_time_ms, client_ip,
                                  is_sse, sse_message_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&record.api_key_id)
    .bind(&record.api_identifier)
    .bind(&record.request_path)
    .bind(&record.request_method)
    .bind(i64::from(record.response_status))
    .bind(record.request_time)
    .bind(record.response_time_ms)
    .bind(&record.client_ip)
    .bind(record.is_sse)
    .bind(record.sse_message_count)
    .execute(pool)
    .await?;
    Ok(())
}
