//! Short-TTL locks guarding singleton background jobs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Key-value store with expiry, used only to stop duplicate scheduling.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` for `ttl` unless it is already held; returns whether this call took it.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn unlock(&self, key: &str) -> Result<()>;

    async fn is_locked(&self, key: &str) -> Result<bool>;
}

/// In-process lock store.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                locks.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.locks.lock().await.remove(key);
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        let locks = self.locks.lock().await;
        Ok(locks.get(key).is_some_and(|at| *at > Instant::now()))
    }
}
