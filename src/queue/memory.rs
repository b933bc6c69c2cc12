//! In-process job queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::{CrawlJob, QueueKind};
use crate::queue::{EnqueueOutcome, FailOutcome, JobQueue, QueueCounts};

struct Pending {
    job: CrawlJob,
    ready_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    active: HashMap<String, CrawlJob>,
    next_seq: u64,
    completed: usize,
    dead: usize,
}

/// Priority queue keyed by deterministic job id.
pub struct MemoryQueue {
    kind: QueueKind,
    max_attempts: u32,
    retry_backoff: Duration,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(kind: QueueKind, max_attempts: u32, retry_backoff: Duration) -> Self {
        Self {
            kind,
            max_attempts: max_attempts.max(1),
            retry_backoff,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue(&self, job: CrawlJob, delay: Option<Duration>) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;

        if state.active.contains_key(&job.id) {
            log::debug!("[{}] {} is in flight, not queued again", self.kind, job.id);
            return Ok(EnqueueOutcome::SkippedActive);
        }

        let ready_at = Instant::now() + delay.unwrap_or_default();
        if let Some(existing) = state.pending.get_mut(&job.id) {
            existing.job.absorb(job);
            existing.ready_at = existing.ready_at.min(ready_at);
            return Ok(EnqueueOutcome::Replaced);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .pending
            .insert(job.id.clone(), Pending { job, ready_at, seq });
        Ok(EnqueueOutcome::Queued)
    }

    async fn drain(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let drained = state.pending.len();
        state.pending.clear();
        if drained > 0 {
            log::info!("[{}] drained {} pending jobs", self.kind, drained);
        }
        Ok(drained)
    }

    async fn get_job(&self, id: &str) -> Result<Option<CrawlJob>> {
        let state = self.state.lock().await;
        Ok(state
            .active
            .get(id)
            .cloned()
            .or_else(|| state.pending.get(id).map(|p| p.job.clone())))
    }

    async fn is_active(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().await.active.contains_key(id))
    }

    async fn take(&self, max: usize) -> Result<Vec<CrawlJob>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut ready: Vec<(u8, u64, String)> = state
            .pending
            .values()
            .filter(|p| p.ready_at <= now)
            .map(|p| (p.job.priority, p.seq, p.job.id.clone()))
            .collect();
        ready.sort_unstable();

        let mut taken = Vec::with_capacity(max.min(ready.len()));
        for (_, _, id) in ready.into_iter().take(max) {
            if let Some(Pending { mut job, .. }) = state.pending.remove(&id) {
                job.attempts += 1;
                state.active.insert(id, job.clone());
                taken.push(job);
            }
        }
        Ok(taken)
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.active.remove(id).is_some() {
            state.completed += 1;
        }
        Ok(())
    }

    async fn fail(&self, id: &str, retryable: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock().await;
        let Some(job) = state.active.remove(id) else {
            return Ok(FailOutcome::Dead);
        };

        if retryable && job.attempts < self.max_attempts {
            let attempt = job.attempts;
            let ready_at = Instant::now() + self.retry_backoff * attempt;
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .pending
                .insert(job.id.clone(), Pending { job, ready_at, seq });
            return Ok(FailOutcome::Retried { attempt });
        }

        state.dead += 1;
        Ok(FailOutcome::Dead)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            pending: state.pending.len(),
            active: state.active.len(),
            completed: state.completed,
            dead: state.dead,
        })
    }
}
