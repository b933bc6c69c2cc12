// src/pipeline/engine.rs

//! Component wiring.
//!
//! Every component is constructed here once and shared by reference; nothing in the crate
//! is a process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::models::Config;
use crate::queue::{LockStore, MemoryLockStore, Queues};
use crate::services::{
    BattleNetClient, ChangeAuditor, CredentialPool, DataProvider, EntityReconciler, OAuthClient,
    RealmDirectory, TokenExchange,
};
use crate::storage::{EntityStore, LocalStorage};

use super::scheduler::CrawlScheduler;

/// The assembled sync engine.
pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn EntityStore>,
    pub queues: Queues,
    pub locks: Arc<dyn LockStore>,
    pub pool: Arc<CredentialPool>,
    pub realms: Arc<RealmDirectory>,
    pub provider: Arc<dyn DataProvider>,
    pub auth: Arc<dyn TokenExchange>,
    pub scheduler: CrawlScheduler,
    pub reconciler: EntityReconciler,
    pub auditor: ChangeAuditor,
}

impl Engine {
    /// Wire the engine around the given collaborators, with in-process queues and locks.
    pub fn new(
        config: Config,
        store: Arc<dyn EntityStore>,
        provider: Arc<dyn DataProvider>,
        auth: Arc<dyn TokenExchange>,
    ) -> Self {
        let queues = Queues::in_memory(
            config.workers.max_attempts,
            Duration::from_secs(config.workers.retry_backoff_secs),
        );
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let pool = Arc::new(CredentialPool::new(
            config.pool.clone(),
            config.seeded_credentials(),
        ));
        let realms = Arc::new(RealmDirectory::new(store.clone()));

        let scheduler = CrawlScheduler::new(
            config.scheduler.clone(),
            queues.clone(),
            pool.clone(),
            realms.clone(),
            store.clone(),
            locks.clone(),
        );
        let reconciler =
            EntityReconciler::new(store.clone(), realms.clone(), config.reconciler.clone());
        let auditor = ChangeAuditor::new(store.clone());

        Self {
            config,
            store,
            queues,
            locks,
            pool,
            realms,
            provider,
            auth,
            scheduler,
            reconciler,
            auditor,
        }
    }

    /// Production wiring: JSON store under `paths.storage_dir` and the HTTP clients.
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(LocalStorage::open(&config.paths.storage_dir).await?);
        let provider = Arc::new(BattleNetClient::new(&config.api)?);
        let auth = Arc::new(OAuthClient::new(&config.api)?);
        Ok(Self::new(config, store, provider, auth))
    }
}
