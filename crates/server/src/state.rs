//! Shared application state and service wiring.

use crate::admin::auth::AdminAuth;
use pylon_core::{
    admission::AdmissionController,
    auth::{repository::SqliteKeyRepository, KeyStore},
    config::AppConfig,
    limits::CounterBank,
    policy::{PolicyHandle, PolicyStore},
    proxy::ProxyEngine,
    queue::WaitQueue,
    recorder::Recorder,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// How many completion records the in-memory buffer holds before the oldest
/// are dropped.
const RECORDER_CAPACITY: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub keystore: Arc<KeyStore>,
    pub admission: Arc<AdmissionController>,
    pub engine: Arc<ProxyEngine>,
    pub recorder: Arc<Recorder>,
    pub policy: Arc<PolicyHandle>,
    pub policy_store: Arc<PolicyStore>,
    pub admin_auth: Arc<AdminAuth>,
    pub pool: SqlitePool,
}

impl AppState {
    /// Builds every service over one database pool. Schema creation is
    /// idempotent. Background workers are started separately with
    /// [`spawn_workers`](Self::spawn_workers).
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation or the initial policy load fails.
    pub async fn initialize(config: &AppConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let repository = Arc::new(SqliteKeyRepository::new(pool.clone()).await?);
        let keystore = Arc::new(KeyStore::new(repository));

        Recorder::init_schema(&pool).await?;
        let recorder = Recorder::new(RECORDER_CAPACITY);

        let policy_store = Arc::new(PolicyStore::open(pool.clone()).await?);
        let policy = policy_store.handle();

        let bank = CounterBank::new();
        let queue = WaitQueue::new();
        let admission = Arc::new(AdmissionController::new(
            bank.clone(),
            queue.clone(),
            Arc::clone(&policy),
        ));
        let engine = Arc::new(ProxyEngine::new(bank, Arc::clone(&recorder))?);

        let admin_auth = Arc::new(AdminAuth::from_config(&config.admin));
        if !admin_auth.enabled() {
            tracing::warn!("admin password or token secret unset; admin login is disabled");
        }

        Ok(Self {
            keystore,
            admission,
            engine,
            recorder,
            policy,
            policy_store,
            admin_auth,
            pool,
        })
    }

    /// Starts the queue dispatcher, the record flush worker, the idle-cell
    /// sweeper, and the request-log retention sweep.
    pub fn spawn_workers(&self) {
        WaitQueue::spawn_dispatcher(
            self.admission.queue().clone(),
            self.admission.bank().clone(),
            Arc::clone(&self.policy),
        );
        Recorder::spawn_flush_worker(Arc::clone(&self.recorder), self.pool.clone());
        CounterBank::spawn_idle_sweeper(self.admission.bank().clone());
        Recorder::spawn_retention_sweeper(self.pool.clone(), Arc::clone(&self.policy));
    }
}
