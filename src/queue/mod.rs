//! Job queue and lock store contracts.
//!
//! The engine relies on a queue offering exactly: enqueue with a deterministic id, drain of
//! queued-but-not-started work, lookup by id and an in-flight check. Durability mechanics
//! belong to the implementation. `MemoryQueue` and `MemoryLockStore` are the in-process
//! implementations used by the CLI and the tests.

pub mod lock;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CrawlJob, QueueKind};

pub use lock::{LockStore, MemoryLockStore};
pub use memory::MemoryQueue;

/// What `enqueue` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No job with this id existed
    Queued,
    /// A pending job with this id absorbed the new one
    Replaced,
    /// A job with this id is in flight; nothing was queued
    SkippedActive,
}

/// What `fail` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued after a backoff
    Retried { attempt: u32 },
    /// Retries exhausted or not retryable
    Dead,
}

/// Point-in-time queue sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub dead: usize,
}

/// A durable job queue for one job kind.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Queue a job under its deterministic id. At most one job per id is ever in flight; a
    /// pending job with the same id absorbs the new one (see `CrawlJob::absorb`).
    async fn enqueue(&self, job: CrawlJob, delay: Option<Duration>) -> Result<EnqueueOutcome>;

    /// Remove every queued-but-not-started job. In-flight jobs run to completion.
    async fn drain(&self) -> Result<usize>;

    /// Look up a pending or in-flight job.
    async fn get_job(&self, id: &str) -> Result<Option<CrawlJob>>;

    async fn is_active(&self, id: &str) -> Result<bool>;

    /// Claim up to `max` ready jobs, lowest priority number first.
    async fn take(&self, max: usize) -> Result<Vec<CrawlJob>>;

    /// Acknowledge a finished job.
    async fn complete(&self, id: &str) -> Result<()>;

    /// Report a failed job; the queue's retry policy decides whether it runs again.
    async fn fail(&self, id: &str, retryable: bool) -> Result<FailOutcome>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// One queue per job kind.
#[derive(Clone)]
pub struct Queues {
    queues: [Arc<dyn JobQueue>; QueueKind::COUNT],
}

impl Queues {
    /// In-process queues sharing one retry policy.
    pub fn in_memory(max_attempts: u32, retry_backoff: Duration) -> Self {
        Self {
            queues: QueueKind::ALL.map(|kind| {
                Arc::new(MemoryQueue::new(kind, max_attempts, retry_backoff)) as Arc<dyn JobQueue>
            }),
        }
    }

    pub fn get(&self, kind: QueueKind) -> &Arc<dyn JobQueue> {
        &self.queues[kind as usize]
    }

    /// Route a job to the queue its payload belongs to.
    pub async fn enqueue(&self, job: CrawlJob, delay: Option<Duration>) -> Result<EnqueueOutcome> {
        self.get(job.queue()).enqueue(job, delay).await
    }

    pub async fn total_counts(&self) -> Result<QueueCounts> {
        let mut total = QueueCounts::default();
        for queue in &self.queues {
            let c = queue.counts().await?;
            total.pending += c.pending;
            total.active += c.active;
            total.completed += c.completed;
            total.dead += c.dead;
        }
        Ok(total)
    }
}
