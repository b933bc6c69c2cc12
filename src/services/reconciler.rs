// src/services/reconciler.rs

//! Entity reconciler.
//!
//! Decides whether a crawl job should create, skip, or refresh a tracked entity. Nothing here
//! writes to the store; the worker persists once the upstream fetch has succeeded.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    Character, CharacterJob, Guild, GuildJob, Realm, ReconcilerConfig, TrackedEntity,
};
use crate::services::realms::RealmDirectory;
use crate::storage::EntityStore;
use crate::utils;

/// What the reconciler decided for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not in the store; built from the job and not yet persisted
    New,
    /// Already known and the job only asked to register missing entities
    CreateOnlyUnique,
    /// Refreshed within the staleness window
    NotReadyToUpdate,
    /// Stale; status reset and ready for fetch-and-merge
    Ready,
}

/// An entity together with the reconciler's decision.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub entity: T,
    pub outcome: ReconcileOutcome,
}

impl<T> Reconciled<T> {
    pub fn is_new(&self) -> bool {
        self.outcome == ReconcileOutcome::New
    }

    pub fn is_create_only_unique(&self) -> bool {
        self.outcome == ReconcileOutcome::CreateOnlyUnique
    }

    pub fn is_not_ready_to_update(&self) -> bool {
        self.outcome == ReconcileOutcome::NotReadyToUpdate
    }

    /// Whether the caller should go on to fetch upstream.
    pub fn needs_fetch(&self) -> bool {
        matches!(self.outcome, ReconcileOutcome::New | ReconcileOutcome::Ready)
    }
}

pub struct EntityReconciler {
    store: Arc<dyn EntityStore>,
    realms: Arc<RealmDirectory>,
    config: ReconcilerConfig,
}

impl EntityReconciler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        realms: Arc<RealmDirectory>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            realms,
            config,
        }
    }

    pub async fn reconcile_character(&self, job: &CharacterJob) -> Result<Reconciled<Character>> {
        self.reconcile_character_at(job, Utc::now()).await
    }

    pub async fn reconcile_character_at(
        &self,
        job: &CharacterJob,
        now: DateTime<Utc>,
    ) -> Result<Reconciled<Character>> {
        let realm = self.resolve_realm(&job.realm).await?;
        let guid = utils::guid(&job.name, &realm.slug);
        let existing = self.store.get_character(&guid).await?;
        let force_update = job
            .force_update_secs
            .unwrap_or(self.config.character_force_update_secs);

        Ok(gate(existing, job.create_only_unique, force_update, now, || {
            let mut character = Character::new(
                &job.name,
                &realm.slug,
                realm.id,
                &realm.name,
                job.source.clone(),
                now,
            );
            character.guild_guid = job.guild_guid.clone();
            character.guild_rank = job.guild_rank;
            character
        }))
    }

    pub async fn reconcile_guild(&self, job: &GuildJob) -> Result<Reconciled<Guild>> {
        self.reconcile_guild_at(job, Utc::now()).await
    }

    pub async fn reconcile_guild_at(
        &self,
        job: &GuildJob,
        now: DateTime<Utc>,
    ) -> Result<Reconciled<Guild>> {
        let realm = self.resolve_realm(&job.realm).await?;
        let guid = utils::guid(&job.name, &realm.slug);
        let existing = self.store.get_guild(&guid).await?;
        let force_update = job
            .force_update_secs
            .unwrap_or(self.config.guild_force_update_secs);

        Ok(gate(existing, job.create_only_unique, force_update, now, || {
            Guild::new(
                &job.name,
                &realm.slug,
                realm.id,
                &realm.name,
                job.source.clone(),
                now,
            )
        }))
    }

    async fn resolve_realm(&self, query: &str) -> Result<Realm> {
        self.realms
            .find_realm(query)
            .await?
            .ok_or_else(|| AppError::not_found(format!("realm '{query}'")))
    }
}

/// Staleness gate shared by every entity kind.
fn gate<T: TrackedEntity>(
    existing: Option<T>,
    create_only_unique: bool,
    force_update_secs: u64,
    now: DateTime<Utc>,
    build: impl FnOnce() -> T,
) -> Reconciled<T> {
    let Some(mut entity) = existing else {
        let entity = build();
        log::debug!("New {} {}", T::KIND, entity.guid());
        return Reconciled {
            entity,
            outcome: ReconcileOutcome::New,
        };
    };

    if create_only_unique {
        return Reconciled {
            entity,
            outcome: ReconcileOutcome::CreateOnlyUnique,
        };
    }

    let window = Duration::seconds(i64::try_from(force_update_secs).unwrap_or(i64::MAX / 1_000));
    let update_safe = now - window;
    if entity.updated_at() > update_safe {
        log::debug!(
            "{} {} refreshed at {}, not ready until {}",
            T::KIND,
            entity.guid(),
            entity.updated_at(),
            entity.updated_at() + window
        );
        return Reconciled {
            entity,
            outcome: ReconcileOutcome::NotReadyToUpdate,
        };
    }

    entity.reset_status();
    Reconciled {
        entity,
        outcome: ReconcileOutcome::Ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CharacterEndpoint, SlotState};
    use crate::storage::LocalStorage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<LocalStorage>,
        reconciler: EntityReconciler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        store
            .upsert_realm(&Realm::new(1602, "gordunni", "Gordunni"))
            .await
            .unwrap();
        let realms = Arc::new(RealmDirectory::new(store.clone()));
        let reconciler = EntityReconciler::new(store.clone(), realms, ReconcilerConfig::default());
        Fixture {
            _dir: dir,
            store,
            reconciler,
        }
    }

    async fn stored_character(store: &LocalStorage, updated_at: DateTime<Utc>) -> Character {
        let mut c = Character::new("Inerius", "gordunni", 1602, "Gordunni", "resync", updated_at);
        c.status.set(CharacterEndpoint::Status, SlotState::Success);
        store.upsert_character(&c).await.unwrap();
        c
    }

    #[tokio::test]
    async fn test_unknown_realm_is_not_found() {
        let f = fixture().await;
        let err = f
            .reconciler
            .reconcile_character(&CharacterJob::new("Inerius", "Azuremyst"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_new_character_is_built_from_job() {
        let f = fixture().await;
        let mut job = CharacterJob::new("iNERIUS", "Gordunni");
        job.source = "roster".into();
        job.guild_rank = Some(3);

        let r = f.reconciler.reconcile_character(&job).await.unwrap();
        assert!(r.is_new());
        assert_eq!(r.entity.guid, "inerius@gordunni");
        assert_eq!(r.entity.name, "Inerius");
        assert_eq!(r.entity.realm_id, 1602);
        assert_eq!(r.entity.source, "roster");
        assert_eq!(r.entity.guild_rank, Some(3));
        // Nothing persisted yet
        assert!(f.store.get_character("inerius@gordunni").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_within_window_is_not_ready_and_untouched() {
        let f = fixture().await;
        let t = Utc::now() - Duration::minutes(10);
        let stored = stored_character(&f.store, t).await;

        let r = f
            .reconciler
            .reconcile_character_at(&CharacterJob::new("Inerius", "gordunni"), t + Duration::minutes(30))
            .await
            .unwrap();
        assert!(r.is_not_ready_to_update());
        assert_eq!(r.entity, stored);
        assert_eq!(
            f.store.get_character(&stored.guid).await.unwrap().unwrap(),
            stored
        );
    }

    #[tokio::test]
    async fn test_stale_entity_is_reset_for_refresh() {
        let f = fixture().await;
        let t = Utc::now() - Duration::hours(3);
        stored_character(&f.store, t).await;

        let r = f
            .reconciler
            .reconcile_character(&CharacterJob::new("Inerius", "gordunni"))
            .await
            .unwrap();
        assert_eq!(r.outcome, ReconcileOutcome::Ready);
        assert!(r.needs_fetch());
        assert_eq!(r.entity.status.to_string(), "------");
    }

    #[tokio::test]
    async fn test_force_update_override() {
        let f = fixture().await;
        let t = Utc::now() - Duration::minutes(10);
        stored_character(&f.store, t).await;

        let mut job = CharacterJob::new("Inerius", "gordunni");
        job.force_update_secs = Some(60);
        let r = f.reconciler.reconcile_character(&job).await.unwrap();
        assert_eq!(r.outcome, ReconcileOutcome::Ready);
    }

    #[tokio::test]
    async fn test_create_only_unique_never_resets_status() {
        let f = fixture().await;
        // Stale enough to be refreshed under normal rules
        let stored = stored_character(&f.store, Utc::now() - Duration::days(30)).await;

        let mut job = CharacterJob::new("Inerius", "gordunni");
        job.create_only_unique = true;
        let r = f.reconciler.reconcile_character(&job).await.unwrap();
        assert!(r.is_create_only_unique());
        assert!(!r.needs_fetch());
        assert_eq!(r.entity.status, stored.status);
        assert_eq!(r.entity.status.to_string(), "S-----");
    }

    #[tokio::test]
    async fn test_guild_uses_guild_window() {
        let f = fixture().await;
        let t = Utc::now() - Duration::minutes(5);
        let guild = Guild::new("Depo", "gordunni", 1602, "Gordunni", "request", t);
        f.store.upsert_guild(&guild).await.unwrap();

        let r = f
            .reconciler
            .reconcile_guild(&GuildJob::new("Depo", "Gordunni"))
            .await
            .unwrap();
        assert!(r.is_not_ready_to_update());

        let r = f
            .reconciler
            .reconcile_guild(&GuildJob::new("Rage of Azeroth", "gordunni"))
            .await
            .unwrap();
        assert!(r.is_new());
        assert_eq!(r.entity.guid, "rage-of-azeroth@gordunni");
    }
}
