// src/pipeline/scheduler.rs

//! Crawl job scheduler.
//!
//! Two policies feed the queues:
//! - bulk resync drains the target queue, then enqueues one job per candidate entity;
//! - demand refresh enqueues a single job, with the commodity snapshot additionally guarded
//!   by a short-TTL lock.
//!
//! Both rely on deterministic job ids, so repeated scheduling collapses onto one job per id.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    AuctionJob, AuctionTarget, COMMODITY_JOB_ID, CharacterJob, CrawlJob, GuildJob, ItemJob,
    JobPayload, QueueKind, RealmJob, SchedulerConfig,
};
use crate::queue::{EnqueueOutcome, JobQueue, LockStore, Queues};
use crate::services::{CredentialPool, RealmDirectory};
use crate::storage::EntityStore;

/// What a bulk resync can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncTarget {
    Realms,
    Characters,
    Guilds,
    Items,
    Auctions,
    Commodity,
}

impl ResyncTarget {
    pub const ALL: [ResyncTarget; 6] = [
        Self::Realms,
        Self::Characters,
        Self::Guilds,
        Self::Items,
        Self::Auctions,
        Self::Commodity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realms => "realms",
            Self::Characters => "characters",
            Self::Guilds => "guilds",
            Self::Items => "items",
            Self::Auctions => "auctions",
            Self::Commodity => "commodity",
        }
    }
}

impl fmt::Display for ResyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResyncTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AppError::validation(format!("unknown resync target '{s}'")))
    }
}

/// Tally of one scheduling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub drained: usize,
    pub queued: usize,
    pub replaced: usize,
    pub skipped_active: usize,
    pub failed: usize,
}

impl ScheduleReport {
    fn record(&mut self, outcome: EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Queued => self.queued += 1,
            EnqueueOutcome::Replaced => self.replaced += 1,
            EnqueueOutcome::SkippedActive => self.skipped_active += 1,
        }
    }
}

impl fmt::Display for ScheduleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "drained {}, queued {}, replaced {}, in flight {}, failed {}",
            self.drained, self.queued, self.replaced, self.skipped_active, self.failed
        )
    }
}

pub struct CrawlScheduler {
    config: SchedulerConfig,
    queues: Queues,
    pool: Arc<CredentialPool>,
    realms: Arc<RealmDirectory>,
    store: Arc<dyn EntityStore>,
    locks: Arc<dyn LockStore>,
}

impl CrawlScheduler {
    pub fn new(
        config: SchedulerConfig,
        queues: Queues,
        pool: Arc<CredentialPool>,
        realms: Arc<RealmDirectory>,
        store: Arc<dyn EntityStore>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        Self {
            config,
            queues,
            pool,
            realms,
            store,
            locks,
        }
    }

    pub async fn resync(&self, target: ResyncTarget) -> Result<ScheduleReport> {
        let report = match target {
            ResyncTarget::Realms => self.resync_realms_at(Utc::now()).await?,
            ResyncTarget::Characters => self.resync_characters().await?,
            ResyncTarget::Guilds => self.resync_guilds().await?,
            ResyncTarget::Items => self.resync_items().await?,
            ResyncTarget::Auctions => self.resync_auctions().await?,
            ResyncTarget::Commodity => {
                let mut report = ScheduleReport::default();
                report.record(self.request_commodity_snapshot().await?);
                report
            }
        };
        log::info!("Resync {}: {}", target, report);
        Ok(report)
    }

    /// Enqueue every realm whose record is older than the staleness offset.
    pub async fn resync_realms_at(&self, now: DateTime<Utc>) -> Result<ScheduleReport> {
        let offset = chrono::Duration::seconds(to_i64(self.config.realm_staleness_secs));
        let payloads: Vec<JobPayload> = self
            .store
            .list_realms()
            .await?
            .into_iter()
            .filter(|r| r.is_stale(now, offset))
            .map(|r| {
                JobPayload::Realm(RealmJob {
                    realm_id: r.id,
                    slug: r.slug,
                    credentials: None,
                })
            })
            .collect();
        self.bulk(QueueKind::Realms, payloads).await
    }

    /// Enqueue every stored character, read in guid order one page at a time.
    pub async fn resync_characters(&self) -> Result<ScheduleReport> {
        let mut report = self.drain(QueueKind::Characters).await?;
        let batch = self.config.batch_size.max(1);
        let mut offset = 0;
        loop {
            let page = self.store.scan_characters(offset, batch).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for character in page {
                let mut job = CharacterJob::new(&character.name, &character.realm);
                job.source = "resync".to_string();
                self.push(JobPayload::Character(job), self.config.bulk_priority, &mut report)
                    .await;
            }
        }
        Ok(report)
    }

    pub async fn resync_guilds(&self) -> Result<ScheduleReport> {
        let mut report = self.drain(QueueKind::Guilds).await?;
        let batch = self.config.batch_size.max(1);
        let mut offset = 0;
        loop {
            let page = self.store.scan_guilds(offset, batch).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for guild in page {
                let mut job = GuildJob::new(&guild.name, &guild.realm);
                job.source = "resync".to_string();
                self.push(JobPayload::Guild(job), self.config.bulk_priority, &mut report)
                    .await;
            }
        }
        Ok(report)
    }

    /// Enqueue one job per item id in the configured range.
    pub async fn resync_items(&self) -> Result<ScheduleReport> {
        let (start, end) = self.config.item_id_range;
        let payloads = (start..=end).map(|item_id| {
            JobPayload::Item(ItemJob {
                item_id,
                credentials: None,
            })
        });
        self.bulk(QueueKind::Items, payloads).await
    }

    /// Enqueue one auction snapshot per known connected realm.
    pub async fn resync_auctions(&self) -> Result<ScheduleReport> {
        let connected: BTreeSet<u32> = self
            .store
            .list_realms()
            .await?
            .into_iter()
            .filter_map(|r| r.connected_realm_id)
            .collect();

        let mut report = self.drain(QueueKind::Auctions).await?;

        // A drained commodity job would otherwise leave its lock held until the TTL runs out.
        let auctions = self.queues.get(QueueKind::Auctions);
        if auctions.get_job(COMMODITY_JOB_ID).await?.is_none() {
            self.locks.unlock(COMMODITY_JOB_ID).await?;
        }

        for id in connected {
            let payload = JobPayload::Auction(AuctionJob {
                target: AuctionTarget::ConnectedRealm(id),
                credentials: None,
            });
            self.push(payload, self.config.bulk_priority, &mut report).await;
        }
        Ok(report)
    }

    /// Demand-driven refresh of a single entity.
    pub async fn request_refresh(&self, payload: JobPayload) -> Result<EnqueueOutcome> {
        if let JobPayload::Auction(AuctionJob {
            target: AuctionTarget::Commodity,
            ..
        }) = payload
        {
            return self.request_commodity_snapshot().await;
        }

        payload.validate()?;
        let payload = self.canonical(payload).await?;
        let job = self.prepare(payload, self.config.demand_priority).await;
        let id = job.id.clone();
        let outcome = self.queues.enqueue(job, None).await?;
        log::debug!("Refresh {} -> {:?}", id, outcome);
        Ok(outcome)
    }

    /// Enqueue the commodity snapshot unless one is already outstanding.
    pub async fn request_commodity_snapshot(&self) -> Result<EnqueueOutcome> {
        let ttl = Duration::from_secs(self.config.commodity_lock_ttl_secs);
        if !self.locks.try_lock(COMMODITY_JOB_ID, ttl).await? {
            log::debug!("Commodity snapshot already outstanding");
            return Ok(EnqueueOutcome::SkippedActive);
        }

        let payload = JobPayload::Auction(AuctionJob {
            target: AuctionTarget::Commodity,
            credentials: None,
        });
        let job = self.prepare(payload, self.config.demand_priority).await;
        match self.queues.enqueue(job, None).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.locks.unlock(COMMODITY_JOB_ID).await?;
                Err(e)
            }
        }
    }

    async fn drain(&self, kind: QueueKind) -> Result<ScheduleReport> {
        Ok(ScheduleReport {
            drained: self.queues.get(kind).drain().await?,
            ..ScheduleReport::default()
        })
    }

    async fn bulk(
        &self,
        kind: QueueKind,
        payloads: impl IntoIterator<Item = JobPayload>,
    ) -> Result<ScheduleReport> {
        let mut report = self.drain(kind).await?;
        for payload in payloads {
            self.push(payload, self.config.bulk_priority, &mut report)
                .await;
        }
        Ok(report)
    }

    /// Enqueue one bulk candidate; failures are counted, never propagated.
    async fn push(&self, payload: JobPayload, priority: u8, report: &mut ScheduleReport) {
        if let Err(e) = payload.validate() {
            log::warn!("Skipping invalid job: {}", e);
            report.failed += 1;
            return;
        }
        let payload = match self.canonical(payload).await {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Skipping job, realm lookup failed: {}", e);
                report.failed += 1;
                return;
            }
        };
        let job = self.prepare(payload, priority).await;
        let id = job.id.clone();
        match self.queues.enqueue(job, None).await {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                log::warn!("Failed to enqueue {}: {}", id, e);
                report.failed += 1;
            }
        }
    }

    /// Rewrite a character or guild realm to its canonical slug so the job id equals the guid
    /// of the entity it refreshes.
    ///
    /// An unknown realm is left as given; the reconciler rejects it when the job runs.
    async fn canonical(&self, mut payload: JobPayload) -> Result<JobPayload> {
        if let Some(realm) = payload.realm_mut() {
            match self.realms.find_realm(realm).await? {
                Some(found) => *realm = found.slug,
                None => log::debug!("Realm '{}' unresolved; job id left as given", realm),
            }
        }
        Ok(payload)
    }

    /// Attach pool credentials when the payload carries none.
    async fn prepare(&self, mut payload: JobPayload, priority: u8) -> CrawlJob {
        if payload.credentials().is_none() {
            match self.pool.select(&self.config.clearance, true).await {
                Ok(credential) => payload.set_credentials(credential.to_job_credentials()),
                // The worker selects again when the job runs
                Err(e) => log::debug!("No credentials attached: {}", e),
            }
        }
        CrawlJob::new(payload, priority)
    }
}

fn to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credential, PoolConfig, Realm};
    use crate::queue::MemoryLockStore;
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queues: Queues,
        locks: Arc<MemoryLockStore>,
        store: Arc<LocalStorage>,
        scheduler: CrawlScheduler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let queues = Queues::in_memory(3, Duration::ZERO);
        let locks = Arc::new(MemoryLockStore::new());
        let mut credential = Credential::new("id", "secret", ["blizzard"]);
        credential.access_token = Some("token".into());
        let pool = Arc::new(CredentialPool::new(PoolConfig::default(), vec![credential]));
        let config = SchedulerConfig {
            item_id_range: (1, 25),
            batch_size: 2,
            ..SchedulerConfig::default()
        };
        let realms = Arc::new(RealmDirectory::new(store.clone()));
        let scheduler = CrawlScheduler::new(
            config,
            queues.clone(),
            pool,
            realms,
            store.clone(),
            locks.clone(),
        );
        Fixture {
            _dir: dir,
            queues,
            locks,
            store,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_repeated_resync_never_duplicates() {
        let f = fixture().await;
        let first = f.scheduler.resync(ResyncTarget::Items).await.unwrap();
        assert_eq!(first.queued, 25);

        let second = f.scheduler.resync(ResyncTarget::Items).await.unwrap();
        assert_eq!(second.drained, 25);
        assert_eq!(second.queued, 25);

        let items = f.queues.get(QueueKind::Items);
        assert_eq!(items.counts().await.unwrap().pending, 25);
    }

    #[tokio::test]
    async fn test_same_id_without_drain_overwrites() {
        let f = fixture().await;
        let payload = JobPayload::Item(ItemJob {
            item_id: 7,
            credentials: None,
        });
        assert_eq!(
            f.scheduler.request_refresh(payload.clone()).await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            f.scheduler.request_refresh(payload).await.unwrap(),
            EnqueueOutcome::Replaced
        );
        let items = f.queues.get(QueueKind::Items);
        assert_eq!(items.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_resync_keeps_in_flight_jobs() {
        let f = fixture().await;
        f.scheduler.resync_items().await.unwrap();
        let items = f.queues.get(QueueKind::Items);
        let taken = items.take(1).await.unwrap();
        assert_eq!(taken.len(), 1);

        let report = f.scheduler.resync_items().await.unwrap();
        assert_eq!(report.skipped_active, 1);
        assert_eq!(report.queued, 24);
        assert!(items.is_active(&taken[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn test_jobs_carry_pool_credentials() {
        let f = fixture().await;
        f.scheduler
            .request_refresh(JobPayload::Character(CharacterJob::new("Inerius", "gordunni")))
            .await
            .unwrap();
        let job = f
            .queues
            .get(QueueKind::Characters)
            .get_job("inerius@gordunni")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload.credentials().map(|c| c.access_token.as_str()), Some("token"));
        assert_eq!(job.priority, SchedulerConfig::default().demand_priority);
    }

    #[tokio::test]
    async fn test_realm_spellings_share_one_job() {
        let f = fixture().await;
        let mut gordunni = Realm::new(1602, "gordunni", "Gordunni");
        gordunni.locale_name = Some("Гордунни".into());
        gordunni.locale_slug = Some("гордунни".into());
        f.store.upsert_realm(&gordunni).await.unwrap();

        let mut outcomes = Vec::new();
        for realm in ["gordunni", "1602", "Гордунни"] {
            let payload = JobPayload::Character(CharacterJob::new("Inerius", realm));
            outcomes.push(f.scheduler.request_refresh(payload).await.unwrap());
        }
        assert_eq!(
            outcomes,
            [
                EnqueueOutcome::Queued,
                EnqueueOutcome::Replaced,
                EnqueueOutcome::Replaced
            ]
        );

        let characters = f.queues.get(QueueKind::Characters);
        let taken = characters.take(10).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, "inerius@gordunni");
        assert!(matches!(taken[0].payload, JobPayload::Character(ref c) if c.realm == "gordunni"));
    }

    #[tokio::test]
    async fn test_unknown_realm_is_queued_as_given() {
        let f = fixture().await;
        let payload = JobPayload::Character(CharacterJob::new("Inerius", "Nowhere"));
        assert_eq!(
            f.scheduler.request_refresh(payload).await.unwrap(),
            EnqueueOutcome::Queued
        );
        let characters = f.queues.get(QueueKind::Characters);
        assert!(characters.get_job("inerius@nowhere").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_refresh_is_rejected() {
        let f = fixture().await;
        let err = f
            .scheduler
            .request_refresh(JobPayload::Character(CharacterJob::new("", "gordunni")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_commodity_is_singleton() {
        let f = fixture().await;
        assert_eq!(
            f.scheduler.request_commodity_snapshot().await.unwrap(),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            f.scheduler.resync(ResyncTarget::Commodity).await.unwrap().skipped_active,
            1
        );
        assert!(f.locks.is_locked(COMMODITY_JOB_ID).await.unwrap());
        let auctions = f.queues.get(QueueKind::Auctions);
        assert_eq!(auctions.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_realm_resync_selects_stale_realms() {
        let f = fixture().await;
        let now = Utc::now();
        let mut fresh = Realm::new(1, "fresh", "Fresh");
        fresh.updated_at = Some(now);
        let mut stale = Realm::new(2, "stale", "Stale");
        stale.updated_at = Some(now - chrono::Duration::days(2));
        let never = Realm::new(3, "never", "Never");
        for realm in [&fresh, &stale, &never] {
            f.store.upsert_realm(realm).await.unwrap();
        }

        let report = f.scheduler.resync_realms_at(now).await.unwrap();
        assert_eq!(report.queued, 2);
        let realms = f.queues.get(QueueKind::Realms);
        assert!(realms.get_job("1").await.unwrap().is_none());
        assert!(realms.get_job("2").await.unwrap().is_some());
        assert!(realms.get_job("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_character_resync_pages_through_store() {
        let f = fixture().await;
        for name in ["Aa", "Bb", "Cc", "Dd", "Ee"] {
            let c = crate::models::Character::new(name, "gordunni", 1602, "Gordunni", "t", Utc::now());
            f.store.upsert_character(&c).await.unwrap();
        }
        let report = f.scheduler.resync_characters().await.unwrap();
        assert_eq!(report.queued, 5);
        let job = f
            .queues
            .get(QueueKind::Characters)
            .get_job("cc@gordunni")
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(job.payload, JobPayload::Character(ref c) if c.source == "resync"));
    }

    #[tokio::test]
    async fn test_auction_resync_dedups_connected_realms() {
        let f = fixture().await;
        for (id, connected) in [(1, 100), (2, 100), (3, 200)] {
            let mut realm = Realm::new(id, format!("r{id}"), format!("R{id}"));
            realm.connected_realm_id = Some(connected);
            f.store.upsert_realm(&realm).await.unwrap();
        }
        let report = f.scheduler.resync_auctions().await.unwrap();
        assert_eq!(report.queued, 2);
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("Items".parse::<ResyncTarget>().unwrap(), ResyncTarget::Items);
        assert!("nope".parse::<ResyncTarget>().is_err());
    }
}
