// src/pipeline/worker.rs

//! Fetch workers.
//!
//! A worker claims a batch of ready jobs, runs them with bounded concurrency and a per-job
//! timeout, then acknowledges each one. A failure only ever affects its own job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::{AppError, Result};
use crate::models::{
    AuctionJob, AuctionTarget, COMMODITY_JOB_ID, Character, CharacterEndpoint, CharacterJob, Credential,
    CrawlJob, Endpoint, FetchStatus, Guild, GuildEndpoint, GuildJob, GuildMember, ItemJob,
    JobCredentials, JobPayload, QueueKind, Realm, RealmJob, SlotState,
};
use crate::queue::{FailOutcome, JobQueue, LockStore, QueueCounts};
use crate::services::responses::{
    CharacterMediaResponse, CharacterMountsResponse, CharacterPetsResponse,
    CharacterProfessionsResponse, CharacterStatusResponse, CharacterSummaryResponse,
    GuildAchievementsResponse, GuildRosterResponse, GuildSummaryResponse, RealmResponse,
};
use crate::services::{ApiRequest, ApiResponse, DataProvider, ReconcileOutcome};
use crate::storage::EntityStore;
use crate::utils;

use super::engine::Engine;

/// Pet species ids are folded into the family hash in their own range so they never collide
/// with mount ids.
const PET_ID_OFFSET: u64 = 1 << 40;

/// What a successful job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Reconciler decided no fetch was needed
    Skipped(ReconcileOutcome),
    /// Entity fetched and persisted; carries the share of sub-fetches that succeeded
    Refreshed { success_percentage: u8 },
    /// Raw document stored
    Stored,
}

/// Tally of processed jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub taken: usize,
    pub completed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub dead: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.taken += other.taken;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.dead += other.dead;
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "taken {}, completed {} ({} skipped), retried {}, dead {}",
            self.taken, self.completed, self.skipped, self.retried, self.dead
        )
    }
}

struct Fetched<T> {
    value: T,
    last_modified: Option<DateTime<Utc>>,
}

/// Consumes crawl jobs from every queue.
pub struct FetchWorker {
    engine: Arc<Engine>,
}

impl FetchWorker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// One pass over every queue.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for kind in QueueKind::ALL {
            report.merge(self.run_batch(kind).await?);
        }
        Ok(report)
    }

    /// Work until every queue is empty, delayed retries included.
    pub async fn run_until_idle(&self) -> Result<BatchReport> {
        let idle = Duration::from_millis(self.engine.config.workers.idle_poll_ms);
        let mut report = BatchReport::default();
        loop {
            let batch = self.run_once().await?;
            report.merge(batch);
            if batch.taken > 0 {
                continue;
            }
            let counts: QueueCounts = self.engine.queues.total_counts().await?;
            if counts.pending == 0 && counts.active == 0 {
                return Ok(report);
            }
            tokio::time::sleep(idle).await;
        }
    }

    /// Claim up to `max_concurrent` ready jobs of one kind and run them.
    pub async fn run_batch(&self, kind: QueueKind) -> Result<BatchReport> {
        let queue = self.engine.queues.get(kind).clone();
        let concurrency = self.engine.config.workers.max_concurrent.max(1);
        let jobs = queue.take(concurrency).await?;

        let mut report = BatchReport {
            taken: jobs.len(),
            ..BatchReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut results = stream::iter(jobs)
            .map(|job| async move {
                let result = self.execute(&job).await;
                (job, result)
            })
            .buffer_unordered(concurrency);

        while let Some((job, result)) = results.next().await {
            self.settle(queue.as_ref(), &job, result, &mut report).await;
        }

        log::info!("[{}] {}", kind, report);
        Ok(report)
    }

    /// Run one job under the job timeout.
    ///
    /// The region-wide commodity download holds an exclusive credential lease for its whole run;
    /// the lease is released however the job ends.
    pub async fn execute(&self, job: &CrawlJob) -> Result<Handled> {
        let lease = if is_commodity(job) {
            Some(self.engine.pool.acquire(&self.engine.config.scheduler.clearance).await?)
        } else {
            None
        };

        let limit = Duration::from_secs(self.engine.config.workers.job_timeout_secs);
        let result = match tokio::time::timeout(limit, self.handle(job, lease.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(AppError::transient(&job.id, "job timed out")),
        };

        if let Some(lease) = lease {
            self.engine.pool.release(&lease.client_id).await;
        }
        result
    }

    async fn settle(
        &self,
        queue: &dyn JobQueue,
        job: &CrawlJob,
        result: Result<Handled>,
        report: &mut BatchReport,
    ) {
        let finished = match result {
            Ok(handled) => {
                log::debug!("[{}] {} done: {:?}", queue.kind(), job.id, handled);
                report.completed += 1;
                if matches!(handled, Handled::Skipped(_)) {
                    report.skipped += 1;
                }
                if let Err(e) = queue.complete(&job.id).await {
                    log::error!("[{}] could not acknowledge {}: {}", queue.kind(), job.id, e);
                }
                true
            }
            Err(error) => {
                let retryable = error.is_transient();
                match queue.fail(&job.id, retryable).await {
                    Ok(FailOutcome::Retried { attempt }) => {
                        log::warn!(
                            "[{}] {} failed (attempt {}), will retry: {}",
                            queue.kind(),
                            job.id,
                            attempt,
                            error
                        );
                        report.retried += 1;
                        false
                    }
                    Ok(FailOutcome::Dead) => {
                        log::warn!("[{}] {} failed: {}", queue.kind(), job.id, error);
                        report.dead += 1;
                        true
                    }
                    Err(e) => {
                        log::error!("[{}] could not fail {}: {}", queue.kind(), job.id, e);
                        true
                    }
                }
            }
        };

        if finished && is_commodity(job) {
            if let Err(e) = self.engine.locks.unlock(COMMODITY_JOB_ID).await {
                log::warn!("Could not release commodity lock: {}", e);
            }
        }
    }

    async fn handle(&self, job: &CrawlJob, lease: Option<&Credential>) -> Result<Handled> {
        let credentials = match lease {
            Some(leased) => leased.to_job_credentials(),
            None => self.credentials_for(job).await?,
        };
        match &job.payload {
            JobPayload::Character(payload) => self.refresh_character(payload, &credentials).await,
            JobPayload::Guild(payload) => self.refresh_guild(payload, &credentials).await,
            JobPayload::Realm(payload) => self.refresh_realm(payload, &credentials).await,
            JobPayload::Item(payload) => self.store_item(payload, &credentials).await,
            JobPayload::Auction(payload) => self.store_auctions(payload, &credentials).await,
        }
    }

    /// The attached credential while it is still usable, otherwise a fresh pick from the pool.
    ///
    /// Leased credentials are never shared.
    async fn credentials_for(&self, job: &CrawlJob) -> Result<JobCredentials> {
        let pool = &self.engine.pool;
        if let Some(attached) = job.payload.credentials() {
            if let Some(current) = pool.usable(&attached.client_id).await {
                return Ok(current.to_job_credentials());
            }
        }
        let clearance = &self.engine.config.scheduler.clearance;
        Ok(pool.select(clearance, true).await?.to_job_credentials())
    }

    /// Fetch one resource, counting rate-limit answers against the credential.
    async fn fetch(&self, request: &ApiRequest, credentials: &JobCredentials) -> Result<ApiResponse> {
        let result = self.engine.provider.fetch(request, credentials).await;
        if let Err(AppError::RateLimited { client_id }) = &result {
            self.engine.pool.record_error(client_id).await;
        }
        result
    }

    async fn fetch_as<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        credentials: &JobCredentials,
    ) -> Result<Fetched<T>> {
        let response = self.fetch(request, credentials).await?;
        Ok(Fetched {
            value: response.decode()?,
            last_modified: response.last_modified,
        })
    }

    /// Fetch one sub-resource and record the outcome in its status slot.
    ///
    /// Transient failures abort the job so the queue retries it; anything else marks the slot
    /// as failed and lets the remaining sub-fetches proceed.
    async fn fetch_slot<E: Endpoint, T: DeserializeOwned>(
        &self,
        status: &mut FetchStatus<E>,
        endpoint: E,
        request: ApiRequest,
        credentials: &JobCredentials,
    ) -> Result<Option<Fetched<T>>> {
        match self.fetch_as(&request, credentials).await {
            Ok(fetched) => {
                status.set(endpoint, SlotState::Success);
                Ok(Some(fetched))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                log::warn!("{} ({}): {}", request.path(), endpoint.name(), e);
                status.set(endpoint, SlotState::Error);
                Ok(None)
            }
        }
    }

    async fn refresh_character(
        &self,
        job: &CharacterJob,
        credentials: &JobCredentials,
    ) -> Result<Handled> {
        let engine = &self.engine;
        let reconciled = engine.reconciler.reconcile_character(job).await?;
        if !reconciled.needs_fetch() {
            return Ok(Handled::Skipped(reconciled.outcome));
        }

        let is_new = reconciled.is_new();
        let original = reconciled.entity;
        let mut updated = original.clone();
        let now = Utc::now();
        let realm = original.realm.clone();
        let name = original.name.clone();

        let status = self
            .fetch_as::<CharacterStatusResponse>(
                &ApiRequest::CharacterStatus {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await;
        match status {
            Ok(fetched) if fetched.value.is_valid => {
                updated.id = Some(fetched.value.id);
                updated.status.set(CharacterEndpoint::Status, SlotState::Success);
            }
            Ok(_) => {
                let gone = AppError::not_found(format!("character {} is not valid", original.guid));
                return self.character_gone(is_new, updated, now, gone).await;
            }
            Err(e @ AppError::NotFound(_)) => {
                return self.character_gone(is_new, updated, now, e).await;
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                log::warn!("{} status: {}", original.guid, e);
                updated.status.set(CharacterEndpoint::Status, SlotState::Error);
            }
        }

        let mut last_modified = None;
        let summary = self
            .fetch_slot::<_, CharacterSummaryResponse>(
                &mut updated.status,
                CharacterEndpoint::Summary,
                ApiRequest::CharacterSummary {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        if let Some(summary) = summary {
            last_modified = summary.last_modified;
            merge_character_summary(&mut updated, summary.value);
        }

        let media = self
            .fetch_slot::<_, CharacterMediaResponse>(
                &mut updated.status,
                CharacterEndpoint::Media,
                ApiRequest::CharacterMedia {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        if let Some(avatar) = media.and_then(|m| m.value.avatar()) {
            updated.avatar = Some(avatar);
        }

        let mut collection_ids = Vec::new();
        let mounts = self
            .fetch_slot::<_, CharacterMountsResponse>(
                &mut updated.status,
                CharacterEndpoint::Mounts,
                ApiRequest::CharacterMounts {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        if let Some(mounts) = mounts {
            collection_ids.extend(mounts.value.mounts.iter().map(|m| m.mount.id));
        }
        let pets = self
            .fetch_slot::<_, CharacterPetsResponse>(
                &mut updated.status,
                CharacterEndpoint::Pets,
                ApiRequest::CharacterPets {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        if let Some(pets) = pets {
            collection_ids.extend(pets.value.pets.iter().map(|p| p.species.id | PET_ID_OFFSET));
        }
        if let Some(hash) = utils::family_hash(&collection_ids) {
            updated.family_hash = Some(hash);
        }

        let professions = self
            .fetch_slot::<_, CharacterProfessionsResponse>(
                &mut updated.status,
                CharacterEndpoint::Professions,
                ApiRequest::CharacterProfessions { realm, name },
                credentials,
            )
            .await?;
        if let Some(professions) = professions {
            updated.professions = professions.value.names();
        }

        updated.last_modified = last_modified.unwrap_or(now);
        updated.updated_at = now;
        updated.rekey();

        // A new guid whose upstream id is already stored is a renamed character.
        let previous = if is_new {
            match updated.id {
                Some(id) => engine
                    .store
                    .find_character_by_id(id)
                    .await?
                    .filter(|c| c.guid != updated.guid),
                None => None,
            }
        } else {
            Some(original)
        };

        if let Some(previous) = previous {
            if previous.guid != updated.guid {
                log::info!("Character renamed: {} -> {}", previous.guid, updated.guid);
                engine.auditor.rewrite_guid(&previous.guid, &updated.guid).await?;
                updated.created_at = previous.created_at;
            }
            engine.auditor.diff_and_log(&previous, &updated).await?;
        }

        engine.store.upsert_character(&updated).await?;
        log::debug!("Character {} refreshed [{}]", updated.guid, updated.status);
        Ok(Handled::Refreshed {
            success_percentage: updated.status.success_percentage(),
        })
    }

    /// Upstream no longer knows the character; remember the failed check on known records.
    async fn character_gone(
        &self,
        is_new: bool,
        mut character: Character,
        now: DateTime<Utc>,
        error: AppError,
    ) -> Result<Handled> {
        if !is_new {
            character.status.set(CharacterEndpoint::Status, SlotState::Error);
            character.updated_at = now;
            self.engine.store.upsert_character(&character).await?;
        }
        Err(error)
    }

    async fn refresh_guild(&self, job: &GuildJob, credentials: &JobCredentials) -> Result<Handled> {
        let engine = &self.engine;
        let reconciled = engine.reconciler.reconcile_guild(job).await?;
        if !reconciled.needs_fetch() {
            return Ok(Handled::Skipped(reconciled.outcome));
        }

        let is_new = reconciled.is_new();
        let original = reconciled.entity;
        let mut updated = original.clone();
        let now = Utc::now();
        let realm = original.realm.clone();
        let name = original.name.clone();

        // The summary doubles as the existence check.
        let summary = self
            .fetch_as::<GuildSummaryResponse>(
                &ApiRequest::GuildSummary {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await;
        let summary = match summary {
            Ok(summary) => summary,
            Err(e @ AppError::NotFound(_)) => {
                if !is_new {
                    updated.status.set(GuildEndpoint::Status, SlotState::Error);
                    updated.updated_at = now;
                    engine.store.upsert_guild(&updated).await?;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        updated.status.set(GuildEndpoint::Status, SlotState::Success);
        updated.status.set(GuildEndpoint::Summary, SlotState::Success);
        let last_modified = summary.last_modified.unwrap_or(now);
        merge_guild_summary(&mut updated, summary.value);
        updated.rekey();

        let roster = self
            .fetch_slot::<_, GuildRosterResponse>(
                &mut updated.status,
                GuildEndpoint::Roster,
                ApiRequest::GuildRoster {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        let members = roster.map(|r| roster_members(r.value));

        let achievements = self
            .fetch_slot::<_, GuildAchievementsResponse>(
                &mut updated.status,
                GuildEndpoint::Achievements,
                ApiRequest::GuildAchievements {
                    realm: realm.clone(),
                    name: name.clone(),
                },
                credentials,
            )
            .await?;
        if let Some(points) = achievements.and_then(|a| a.value.total_points) {
            updated.achievement_points = Some(points);
        }

        let activity = self
            .fetch_slot::<_, serde_json::Value>(
                &mut updated.status,
                GuildEndpoint::Activity,
                ApiRequest::GuildActivity { realm, name },
                credentials,
            )
            .await?;
        if let Some(activity) = activity {
            engine
                .store
                .put_snapshot("guild-activity", &updated.guid, &activity.value)
                .await?;
        }

        updated.last_modified = last_modified;
        updated.updated_at = now;

        // A new guid whose upstream id is already stored is a renamed or transferred guild.
        let previous = if is_new {
            match updated.id {
                Some(id) => engine
                    .store
                    .find_guild_by_id(id)
                    .await?
                    .filter(|g| g.guid != updated.guid),
                None => None,
            }
        } else {
            Some(original)
        };

        if let Some(previous) = &previous {
            if previous.guid != updated.guid {
                log::info!("Guild renamed: {} -> {}", previous.guid, updated.guid);
                engine.auditor.rewrite_guid(&previous.guid, &updated.guid).await?;
                updated.created_at = previous.created_at;
            }
            if let Some(members) = &members {
                engine
                    .auditor
                    .detect_guild_master_change_at(previous, members, last_modified)
                    .await?;
            }
            engine.auditor.diff_and_log(previous, &updated).await?;
        }
        if let Some(members) = &members {
            updated.members = members.clone();
        }
        engine.store.upsert_guild(&updated).await?;

        if let Some(members) = members {
            self.register_members(&updated, &members).await;
        }

        log::debug!("Guild {} refreshed [{}]", updated.guid, updated.status);
        Ok(Handled::Refreshed {
            success_percentage: updated.status.success_percentage(),
        })
    }

    /// Register roster members that are not yet tracked; one bad member never stops the rest.
    async fn register_members(&self, guild: &Guild, members: &[GuildMember]) {
        let mut failed = 0;
        for member in members {
            let mut job = CharacterJob::new(&member.name, &member.realm);
            job.create_only_unique = true;
            job.source = "roster".to_string();
            job.guild_guid = Some(guild.guid.clone());
            job.guild_rank = Some(member.rank);
            if let Err(e) = self
                .engine
                .scheduler
                .request_refresh(JobPayload::Character(job))
                .await
            {
                log::warn!("Roster member {} of {}: {}", member.guid, guild.guid, e);
                failed += 1;
            }
        }
        log::debug!(
            "Guild {}: {} roster members scheduled, {} failed",
            guild.guid,
            members.len() - failed,
            failed
        );
    }

    async fn refresh_realm(&self, job: &RealmJob, credentials: &JobCredentials) -> Result<Handled> {
        let engine = &self.engine;
        let response = self
            .fetch_as::<RealmResponse>(
                &ApiRequest::Realm {
                    slug: job.slug.clone(),
                },
                credentials,
            )
            .await?
            .value;

        let existing = engine
            .store
            .list_realms()
            .await?
            .into_iter()
            .find(|r| r.id == response.id || r.id == job.realm_id);
        let mut realm = existing.unwrap_or_else(|| {
            Realm::new(response.id, response.slug.clone(), response.name.clone())
        });
        realm.id = response.id;
        realm.slug = response.slug.clone();
        realm.name = response.name.clone();
        realm.connected_realm_id = response.connected_realm_id().or(realm.connected_realm_id);
        realm.updated_at = Some(Utc::now());

        engine.store.upsert_realm(&realm).await?;
        engine.realms.reload().await?;
        Ok(Handled::Stored)
    }

    async fn store_item(&self, job: &ItemJob, credentials: &JobCredentials) -> Result<Handled> {
        let response = self
            .fetch(&ApiRequest::Item { id: job.item_id }, credentials)
            .await?;
        self.engine
            .store
            .put_snapshot("items", &job.item_id.to_string(), &response.body)
            .await?;
        Ok(Handled::Stored)
    }

    async fn store_auctions(
        &self,
        job: &AuctionJob,
        credentials: &JobCredentials,
    ) -> Result<Handled> {
        let (request, key) = match job.target {
            AuctionTarget::ConnectedRealm(id) => (
                ApiRequest::Auctions {
                    connected_realm_id: id,
                },
                id.to_string(),
            ),
            AuctionTarget::Commodity => (ApiRequest::Commodities, "commodity".to_string()),
        };
        let response = self.fetch(&request, credentials).await?;
        self.engine
            .store
            .put_snapshot("auctions", &key, &response.body)
            .await?;
        Ok(Handled::Stored)
    }
}

fn is_commodity(job: &CrawlJob) -> bool {
    matches!(
        job.payload,
        JobPayload::Auction(AuctionJob {
            target: AuctionTarget::Commodity,
            ..
        })
    )
}

fn merge_character_summary(character: &mut Character, summary: CharacterSummaryResponse) {
    character.id = Some(summary.id);
    character.name = utils::canonical_name(&summary.name);
    character.realm = summary.realm.slug;
    character.realm_id = summary.realm.id;
    if let Some(realm_name) = summary.realm.name {
        character.realm_name = realm_name;
    }
    if let Some(gender) = summary.gender {
        character.gender = Some(gender.name);
    }
    if let Some(faction) = summary.faction {
        character.faction = Some(faction.name);
    }
    if let Some(race) = summary.race {
        character.race = Some(race.name);
    }
    if let Some(class) = summary.character_class {
        character.class = Some(class.name);
    }
    if summary.level.is_some() {
        character.level = summary.level;
    }

    match summary.guild {
        Some(guild) => {
            let guid = utils::guid(&guild.name, &guild.realm.slug);
            if character.guild_guid.as_deref() != Some(guid.as_str()) {
                character.guild_rank = None;
            }
            character.guild_guid = Some(guid);
        }
        None => {
            character.guild_guid = None;
            character.guild_rank = None;
        }
    }
}

fn merge_guild_summary(guild: &mut Guild, summary: GuildSummaryResponse) {
    guild.id = Some(summary.id);
    guild.name = summary.name;
    guild.realm = summary.realm.slug;
    guild.realm_id = summary.realm.id;
    if let Some(realm_name) = summary.realm.name {
        guild.realm_name = realm_name;
    }
    if let Some(faction) = summary.faction {
        guild.faction = Some(faction.name);
    }
    if summary.achievement_points.is_some() {
        guild.achievement_points = summary.achievement_points;
    }
}

fn roster_members(roster: GuildRosterResponse) -> Vec<GuildMember> {
    roster
        .members
        .into_iter()
        .map(|entry| {
            let character = entry.character;
            GuildMember {
                id: character.id,
                guid: utils::guid(&character.name, &character.realm.slug),
                name: utils::canonical_name(&character.name),
                realm: character.realm.slug,
                rank: entry.rank,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccessToken, AuditAction, Config, CredentialConfig, CredentialStatus, MASTER_RANK,
        MasterTransition,
    };
    use crate::queue::EnqueueOutcome;
    use crate::services::{CredentialPool, TokenExchange};
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Reply {
        Body(Value),
        NotFound,
        RateLimited,
        Transient,
        /// Answers not-found once the delay has passed
        Slow(Duration),
    }

    #[derive(Default)]
    struct FakeApi {
        replies: Mutex<HashMap<String, Reply>>,
        /// When set, every fetch records the pool's credential states as seen mid-job
        watched: Mutex<Option<Arc<CredentialPool>>>,
        seen: Mutex<Vec<CredentialStatus>>,
    }

    impl FakeApi {
        fn set(&self, request: ApiRequest, reply: Reply) {
            self.replies.lock().unwrap().insert(request.path(), reply);
        }
    }

    #[async_trait]
    impl DataProvider for FakeApi {
        async fn fetch(
            &self,
            request: &ApiRequest,
            credentials: &JobCredentials,
        ) -> Result<ApiResponse> {
            let watched = self.watched.lock().unwrap().clone();
            if let Some(pool) = watched {
                let states = pool.snapshot().await.into_iter().map(|c| c.status);
                self.seen.lock().unwrap().extend(states);
            }

            let reply = self.replies.lock().unwrap().get(&request.path()).cloned();
            match reply {
                Some(Reply::Body(body)) => Ok(ApiResponse::new(body)),
                Some(Reply::RateLimited) => Err(AppError::rate_limited(&credentials.client_id)),
                Some(Reply::Transient) => {
                    Err(AppError::transient(request.path(), "upstream answered 503"))
                }
                Some(Reply::Slow(delay)) => {
                    tokio::time::sleep(delay).await;
                    Err(AppError::not_found(request.path()))
                }
                Some(Reply::NotFound) | None => Err(AppError::not_found(request.path())),
            }
        }
    }

    struct FakeAuth;

    #[async_trait]
    impl TokenExchange for FakeAuth {
        async fn exchange(&self, client_id: &str, _secret: &str) -> Result<AccessToken> {
            Ok(AccessToken {
                access_token: format!("token-{client_id}"),
                expires_in: 86_400,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        api: Arc<FakeApi>,
        engine: Arc<Engine>,
        worker: FetchWorker,
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    async fn fixture_with(tune: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let mut realm = Realm::new(1602, "gordunni", "Gordunni");
        realm.connected_realm_id = Some(1602);
        store.upsert_realm(&realm).await.unwrap();

        let mut config = Config::default();
        config.credentials.push(CredentialConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            tags: config.pool.managed_tags.clone(),
        });
        config.workers.retry_backoff_secs = 0;
        config.workers.idle_poll_ms = 10;
        tune(&mut config);

        let api = Arc::new(FakeApi::default());
        let engine = Arc::new(Engine::new(config, store, api.clone(), Arc::new(FakeAuth)));
        engine.pool.refresh_expiring(engine.auth.as_ref()).await;
        let worker = FetchWorker::new(engine.clone());
        Fixture {
            _dir: dir,
            api,
            engine,
            worker,
        }
    }

    fn character_request(tail: &str, name: &str) -> ApiRequest {
        let (realm, name) = ("gordunni".to_string(), name.to_string());
        match tail {
            "status" => ApiRequest::CharacterStatus { realm, name },
            "summary" => ApiRequest::CharacterSummary { realm, name },
            "media" => ApiRequest::CharacterMedia { realm, name },
            "mounts" => ApiRequest::CharacterMounts { realm, name },
            "pets" => ApiRequest::CharacterPets { realm, name },
            _ => ApiRequest::CharacterProfessions { realm, name },
        }
    }

    fn stub_character(api: &FakeApi, name: &str, id: u64, faction: &str, mounts: &[u64]) {
        api.set(
            character_request("status", name),
            Reply::Body(json!({ "id": id, "is_valid": true })),
        );
        api.set(
            character_request("summary", name),
            Reply::Body(json!({
                "id": id,
                "name": name,
                "realm": { "id": 1602, "slug": "gordunni", "name": "Gordunni" },
                "faction": { "name": faction },
                "race": { "name": "Orc" },
                "character_class": { "name": "Warrior" },
                "level": 70,
                "guild": { "name": "Depo", "realm": { "id": 1602, "slug": "gordunni" } }
            })),
        );
        let mounts: Vec<Value> = mounts.iter().map(|id| json!({ "mount": { "id": id } })).collect();
        api.set(
            character_request("mounts", name),
            Reply::Body(json!({ "mounts": mounts })),
        );
        api.set(
            character_request("pets", name),
            Reply::Body(json!({ "pets": [] })),
        );
        api.set(
            character_request("professions", name),
            Reply::Body(json!({
                "primaries": [{ "profession": { "name": "Mining" } }],
                "secondaries": []
            })),
        );
        // Media left unanswered
    }

    async fn refresh(f: &Fixture, name: &str) -> EnqueueOutcome {
        let mut job = CharacterJob::new(name, "Gordunni");
        job.force_update_secs = Some(0);
        f.engine
            .scheduler
            .request_refresh(JobPayload::Character(job))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_character_refresh_persists_partial_status() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Horde", &[6, 7]);
        refresh(&f, "Inerius").await;

        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 1);

        let c = f
            .engine
            .store
            .get_character("inerius@gordunni")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.id, Some(42));
        assert_eq!(c.faction.as_deref(), Some("Horde"));
        assert_eq!(c.status.to_string(), "SUmNPR");
        assert_eq!(c.professions, vec!["Mining".to_string()]);
        assert!(c.family_hash.is_some());
    }

    #[tokio::test]
    async fn test_faction_change_is_audited() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Alliance", &[1]);
        refresh(&f, "Inerius").await;
        f.worker.run_until_idle().await.unwrap();

        stub_character(&f.api, "Inerius", 42, "Horde", &[1]);
        refresh(&f, "Inerius").await;
        f.worker.run_until_idle().await.unwrap();

        let audit = f.engine.store.audit_for("inerius@gordunni").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!((audit[0].original.as_str(), audit[0].updated.as_str()), ("Alliance", "Horde"));
    }

    #[tokio::test]
    async fn test_rename_moves_audit_history() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Alliance", &[1]);
        refresh(&f, "Inerius").await;
        f.worker.run_until_idle().await.unwrap();
        stub_character(&f.api, "Inerius", 42, "Horde", &[1]);
        refresh(&f, "Inerius").await;
        f.worker.run_until_idle().await.unwrap();

        stub_character(&f.api, "Blinkus", 42, "Horde", &[1]);
        refresh(&f, "Blinkus").await;
        f.worker.run_until_idle().await.unwrap();

        assert!(f.engine.store.audit_for("inerius@gordunni").await.unwrap().is_empty());
        let audit = f.engine.store.audit_for("blinkus@gordunni").await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].original, "Inerius");
        assert_eq!(audit[1].updated, "Blinkus");
    }

    #[tokio::test]
    async fn test_unknown_character_is_dead_not_stored() {
        let f = fixture().await;
        refresh(&f, "Ghost").await;
        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.dead, 1);
        assert!(f
            .engine
            .store
            .get_character("ghost@gordunni")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_counts_against_credential_and_retries() {
        let f = fixture().await;
        f.api.set(character_request("status", "Inerius"), Reply::RateLimited);
        refresh(&f, "Inerius").await;

        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.dead, 1);
        assert_eq!(f.engine.pool.snapshot().await[0].error_counts, 3);
    }

    #[tokio::test]
    async fn test_guild_master_change_and_roster_registration() {
        let f = fixture().await;
        let guild = ("gordunni".to_string(), "Depo".to_string());
        f.api.set(
            ApiRequest::GuildSummary {
                realm: guild.0.clone(),
                name: guild.1.clone(),
            },
            Reply::Body(json!({
                "id": 7,
                "name": "Depo",
                "realm": { "id": 1602, "slug": "gordunni" },
                "faction": { "name": "Horde" }
            })),
        );
        let roster = |master: (u64, &str), member: (u64, &str)| {
            json!({ "members": [
                { "character": { "id": master.0, "name": master.1, "realm": { "id": 1602, "slug": "gordunni" } }, "rank": MASTER_RANK },
                { "character": { "id": member.0, "name": member.1, "realm": { "id": 1602, "slug": "gordunni" } }, "rank": 4 }
            ]})
        };
        let roster_request = ApiRequest::GuildRoster {
            realm: guild.0.clone(),
            name: guild.1.clone(),
        };
        f.api.set(roster_request.clone(), Reply::Body(roster((1, "Aa"), (2, "Bb"))));
        for (id, name) in [(1, "Aa"), (2, "Bb")] {
            stub_character(&f.api, name, id, "Horde", &[100, 200]);
        }

        let mut job = GuildJob::new("Depo", "gordunni");
        job.force_update_secs = Some(0);
        f.engine
            .scheduler
            .request_refresh(JobPayload::Guild(job.clone()))
            .await
            .unwrap();
        f.worker.run_until_idle().await.unwrap();

        // Roster members were registered through their own jobs
        let aa = f.engine.store.get_character("aa@gordunni").await.unwrap().unwrap();
        assert_eq!(aa.source, "roster");
        assert_eq!(aa.guild_rank, Some(MASTER_RANK));
        assert!(f.engine.store.get_character("bb@gordunni").await.unwrap().is_some());

        // Leadership passes within the same account lineage
        f.api.set(roster_request, Reply::Body(roster((2, "Bb"), (1, "Aa"))));
        f.engine
            .scheduler
            .request_refresh(JobPayload::Guild(job))
            .await
            .unwrap();
        f.worker.run_until_idle().await.unwrap();

        let demoted = f.engine.store.audit_for("aa@gordunni").await.unwrap();
        let promoted = f.engine.store.audit_for("bb@gordunni").await.unwrap();
        assert_eq!(demoted.len(), 1);
        assert_eq!(promoted.len(), 1);
        assert!(matches!(
            promoted[0].action,
            AuditAction::GuildMaster {
                transition: MasterTransition::Inherit,
                ..
            }
        ));

        let stored = f.engine.store.get_guild("depo@gordunni").await.unwrap().unwrap();
        assert_eq!(stored.master().map(|m| m.id), Some(2));
        assert_eq!(stored.status.to_string(), "SURav");
    }

    #[tokio::test]
    async fn test_commodity_releases_lock() {
        let f = fixture().await;
        f.api.set(ApiRequest::Commodities, Reply::Body(json!({ "auctions": [] })));
        f.engine.scheduler.request_commodity_snapshot().await.unwrap();
        assert!(f.engine.locks.is_locked(COMMODITY_JOB_ID).await.unwrap());

        f.worker.run_until_idle().await.unwrap();
        assert!(!f.engine.locks.is_locked(COMMODITY_JOB_ID).await.unwrap());
        assert!(f
            .engine
            .store
            .get_snapshot("auctions", "commodity")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_realm_refresh_reloads_directory() {
        let f = fixture().await;
        f.api.set(
            ApiRequest::Realm {
                slug: "howling-fjord".into(),
            },
            Reply::Body(json!({
                "id": 1615,
                "slug": "howling-fjord",
                "name": "Howling Fjord",
                "connected_realm": { "href": "https://eu.api.blizzard.com/data/wow/connected-realm/1615" }
            })),
        );
        assert!(f.engine.realms.find_realm("Howling Fjord").await.unwrap().is_none());

        f.engine
            .scheduler
            .request_refresh(JobPayload::Realm(RealmJob {
                realm_id: 1615,
                slug: "howling-fjord".into(),
                credentials: None,
            }))
            .await
            .unwrap();
        f.worker.run_until_idle().await.unwrap();

        let realm = f.engine.realms.find_realm("Howling Fjord").await.unwrap().unwrap();
        assert_eq!(realm.connected_realm_id, Some(1615));
    }

    #[tokio::test]
    async fn test_commodity_holds_exclusive_lease_while_fetching() {
        let f = fixture().await;
        f.api.set(ApiRequest::Commodities, Reply::Body(json!({ "auctions": [] })));
        *f.api.watched.lock().unwrap() = Some(f.engine.pool.clone());
        f.engine.scheduler.request_commodity_snapshot().await.unwrap();

        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(*f.api.seen.lock().unwrap(), vec![CredentialStatus::Taken]);

        let after = f.engine.pool.snapshot().await;
        assert_eq!(after[0].status, CredentialStatus::Free);
        assert!(after[0].reset_at.is_none());
    }

    #[tokio::test]
    async fn test_leased_credential_is_not_shared() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Horde", &[1]);
        let lease = f.engine.pool.acquire("blizzard").await.unwrap();
        refresh(&f, "Inerius").await;

        // The pool has nothing free, so the job retries until it runs out of attempts
        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!((report.retried, report.dead), (2, 1));
        assert_eq!(f.engine.pool.snapshot().await[0].status, CredentialStatus::Taken);

        f.engine.pool.release(&lease.client_id).await;
        refresh(&f, "Inerius").await;
        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_guild_rename_moves_audit_history() {
        let f = fixture().await;
        let summary = |name: &str, faction: &str| {
            json!({
                "id": 7,
                "name": name,
                "realm": { "id": 1602, "slug": "gordunni" },
                "faction": { "name": faction }
            })
        };
        let summary_request = |name: &str| ApiRequest::GuildSummary {
            realm: "gordunni".into(),
            name: name.into(),
        };
        let crawl = |name: &'static str| {
            let mut job = GuildJob::new(name, "gordunni");
            job.force_update_secs = Some(0);
            JobPayload::Guild(job)
        };

        f.api.set(summary_request("Depo"), Reply::Body(summary("Depo", "Alliance")));
        f.engine.scheduler.request_refresh(crawl("Depo")).await.unwrap();
        f.worker.run_until_idle().await.unwrap();
        f.api.set(summary_request("Depo"), Reply::Body(summary("Depo", "Horde")));
        f.engine.scheduler.request_refresh(crawl("Depo")).await.unwrap();
        f.worker.run_until_idle().await.unwrap();

        let first = f.engine.store.get_guild("depo@gordunni").await.unwrap().unwrap();
        assert_eq!(f.engine.store.audit_for("depo@gordunni").await.unwrap().len(), 1);

        // Same upstream id, new name
        f.api.set(
            summary_request("Depo Reborn"),
            Reply::Body(summary("Depo Reborn", "Horde")),
        );
        f.engine.scheduler.request_refresh(crawl("Depo Reborn")).await.unwrap();
        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!(report.completed, 1);

        assert!(f.engine.store.audit_for("depo@gordunni").await.unwrap().is_empty());
        let audit = f.engine.store.audit_for("depo-reborn@gordunni").await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!((audit[1].original.as_str(), audit[1].updated.as_str()), ("Depo", "Depo Reborn"));

        let renamed = f
            .engine
            .store
            .get_guild("depo-reborn@gordunni")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.id, Some(7));
        assert_eq!(renamed.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_job_timeout_is_retried() {
        let f = fixture_with(|config| {
            config.workers.job_timeout_secs = 1;
            config.workers.max_attempts = 2;
        })
        .await;
        f.api.set(
            character_request("status", "Inerius"),
            Reply::Slow(Duration::from_secs(3)),
        );
        refresh(&f, "Inerius").await;

        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!((report.retried, report.dead), (1, 1));
        assert!(f
            .engine
            .store
            .get_character("inerius@gordunni")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transient_sub_fetch_aborts_job() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Horde", &[1]);
        f.api.set(character_request("mounts", "Inerius"), Reply::Transient);
        refresh(&f, "Inerius").await;

        let report = f.worker.run_until_idle().await.unwrap();
        assert_eq!((report.completed, report.retried, report.dead), (0, 2, 1));
        assert!(f
            .engine
            .store
            .get_character("inerius@gordunni")
            .await
            .unwrap()
            .is_none());
        // Only rate-limit answers count against the credential
        assert_eq!(f.engine.pool.snapshot().await[0].error_counts, 0);
    }

    #[tokio::test]
    async fn test_failing_job_leaves_batch_siblings_alone() {
        let f = fixture().await;
        stub_character(&f.api, "Inerius", 42, "Horde", &[1]);
        f.api.set(character_request("status", "Blinkus"), Reply::Transient);
        refresh(&f, "Inerius").await;
        refresh(&f, "Blinkus").await;

        let report = f.worker.run_batch(QueueKind::Characters).await.unwrap();
        assert_eq!(report.taken, 2);
        assert_eq!((report.completed, report.retried), (1, 1));
        assert!(f
            .engine
            .store
            .get_character("inerius@gordunni")
            .await
            .unwrap()
            .is_some());
    }
}
