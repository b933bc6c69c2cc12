//! Application configuration structures.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Credential;

/// Environment variables that seed a credential when the config file has none.
pub const ENV_CLIENT_ID: &str = "REALM_SYNC_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "REALM_SYNC_CLIENT_SECRET";

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Upstream API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Credential pool behaviour
    #[serde(default)]
    pub pool: PoolConfig,

    /// Resync cadence and batching
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Staleness windows
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Fetch worker concurrency and retry policy
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Seeded API credentials
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Add a credential from the environment if both variables are set.
    pub fn apply_env(&mut self) {
        if let (Ok(client_id), Ok(client_secret)) = (
            std::env::var(ENV_CLIENT_ID),
            std::env::var(ENV_CLIENT_SECRET),
        ) {
            if self.credentials.iter().any(|c| c.client_id == client_id) {
                return;
            }
            self.credentials.push(CredentialConfig {
                client_id,
                client_secret,
                tags: self.pool.managed_tags.clone(),
            });
        }
    }

    /// Validate configuration values for basic sanity.
    ///
    /// A failure here is the only fatal error class: the process cannot start without it.
    pub fn validate(&self) -> Result<()> {
        if self.api.region.trim().is_empty() {
            return Err(AppError::validation("api.region is empty"));
        }
        if self.api.timeout_secs == 0 {
            return Err(AppError::validation("api.timeout_secs must be > 0"));
        }
        if self.workers.max_concurrent == 0 {
            return Err(AppError::validation("workers.max_concurrent must be > 0"));
        }
        if self.workers.job_timeout_secs == 0 {
            return Err(AppError::validation("workers.job_timeout_secs must be > 0"));
        }
        if self.pool.managed_tags.is_empty() {
            return Err(AppError::validation("pool.managed_tags is empty"));
        }
        if !self.pool.managed_tags.contains(&self.scheduler.clearance) {
            return Err(AppError::validation(format!(
                "scheduler.clearance '{}' is not a managed tag",
                self.scheduler.clearance
            )));
        }
        if self.scheduler.item_id_range.0 > self.scheduler.item_id_range.1 {
            return Err(AppError::validation("scheduler.item_id_range is inverted"));
        }
        if self.credentials.is_empty() {
            return Err(AppError::config(format!(
                "No credentials configured; add [[credentials]] or set {ENV_CLIENT_ID}/{ENV_CLIENT_SECRET}"
            )));
        }
        for cred in &self.credentials {
            if cred.client_id.trim().is_empty() || cred.client_secret.trim().is_empty() {
                return Err(AppError::config("credential with empty client id or secret"));
            }
        }
        Ok(())
    }

    /// Credentials as pool entries.
    pub fn seeded_credentials(&self) -> Vec<Credential> {
        self.credentials
            .iter()
            .map(|c| Credential::new(&c.client_id, &c.client_secret, c.tags.iter().cloned()))
            .collect()
    }
}

/// Upstream API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Region prefix, e.g. "eu"
    #[serde(default = "defaults::region")]
    pub region: String,

    /// Response locale, e.g. "en_GB"
    #[serde(default = "defaults::locale")]
    pub locale: String,

    /// Base URL; `{region}` is substituted
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// OAuth token endpoint
    #[serde(default = "defaults::auth_url")]
    pub auth_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn base_url(&self) -> String {
        self.base_url.replace("{region}", &self.region)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            region: defaults::region(),
            locale: defaults::locale(),
            base_url: defaults::base_url(),
            auth_url: defaults::auth_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Credential pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Clearance tags the sweeper manages
    #[serde(default = "defaults::managed_tags")]
    pub managed_tags: BTreeSet<String>,

    /// Error count above which a credential's circuit opens
    #[serde(default = "defaults::error_threshold")]
    pub error_threshold: u32,

    /// How long an open circuit stays open
    #[serde(default = "defaults::cooldown")]
    pub cooldown_secs: u64,

    /// How long an exclusive lease lasts before the sweeper frees it
    #[serde(default = "defaults::lease")]
    pub lease_secs: u64,

    /// Refresh tokens expiring within this margin
    #[serde(default = "defaults::refresh_margin")]
    pub refresh_margin_secs: u64,

    #[serde(default = "defaults::sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            managed_tags: defaults::managed_tags(),
            error_threshold: defaults::error_threshold(),
            cooldown_secs: defaults::cooldown(),
            lease_secs: defaults::lease(),
            refresh_margin_secs: defaults::refresh_margin(),
            sweep_interval_secs: defaults::sweep_interval(),
        }
    }
}

/// Bulk resync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Realms refreshed longer ago than this are resynced
    #[serde(default = "defaults::realm_staleness")]
    pub realm_staleness_secs: u64,

    /// Entities read from the store per scan page
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Inclusive item id range for item resync
    #[serde(default = "defaults::item_id_range")]
    pub item_id_range: (u64, u64),

    #[serde(default = "defaults::realm_interval")]
    pub realm_interval_secs: u64,

    #[serde(default = "defaults::character_interval")]
    pub character_interval_secs: u64,

    #[serde(default = "defaults::guild_interval")]
    pub guild_interval_secs: u64,

    #[serde(default = "defaults::item_interval")]
    pub item_interval_secs: u64,

    #[serde(default = "defaults::auction_interval")]
    pub auction_interval_secs: u64,

    /// How long the commodity singleton lock is held
    #[serde(default = "defaults::commodity_lock_ttl")]
    pub commodity_lock_ttl_secs: u64,

    /// Priority of bulk resync jobs
    #[serde(default = "defaults::bulk_priority")]
    pub bulk_priority: u8,

    /// Priority of demand-driven jobs
    #[serde(default = "defaults::demand_priority")]
    pub demand_priority: u8,

    /// Clearance tag of the credentials attached to crawl jobs
    #[serde(default = "defaults::clearance")]
    pub clearance: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            realm_staleness_secs: defaults::realm_staleness(),
            batch_size: defaults::batch_size(),
            item_id_range: defaults::item_id_range(),
            realm_interval_secs: defaults::realm_interval(),
            character_interval_secs: defaults::character_interval(),
            guild_interval_secs: defaults::guild_interval(),
            item_interval_secs: defaults::item_interval(),
            auction_interval_secs: defaults::auction_interval(),
            commodity_lock_ttl_secs: defaults::commodity_lock_ttl(),
            bulk_priority: defaults::bulk_priority(),
            demand_priority: defaults::demand_priority(),
            clearance: defaults::clearance(),
        }
    }
}

/// Default staleness windows per entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "defaults::character_force_update")]
    pub character_force_update_secs: u64,

    #[serde(default = "defaults::guild_force_update")]
    pub guild_force_update_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            character_force_update_secs: defaults::character_force_update(),
            guild_force_update_secs: defaults::guild_force_update(),
        }
    }
}

/// Fetch worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum simultaneous in-flight jobs per queue
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Upper bound on a single job, upstream calls included
    #[serde(default = "defaults::job_timeout")]
    pub job_timeout_secs: u64,

    /// Attempts before a transient failure becomes final
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Poll interval when queues are empty
    #[serde(default = "defaults::idle_poll")]
    pub idle_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            job_timeout_secs: defaults::job_timeout(),
            max_attempts: defaults::max_attempts(),
            retry_backoff_secs: defaults::retry_backoff(),
            idle_poll_ms: defaults::idle_poll(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "defaults::storage_dir")]
    pub storage_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage_dir: defaults::storage_dir(),
        }
    }
}

/// A credential as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "defaults::managed_tags")]
    pub tags: BTreeSet<String>,
}

mod defaults {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    // API defaults
    pub fn region() -> String {
        "eu".into()
    }
    pub fn locale() -> String {
        "en_GB".into()
    }
    pub fn base_url() -> String {
        "https://{region}.api.blizzard.com".into()
    }
    pub fn auth_url() -> String {
        "https://oauth.battle.net/token".into()
    }
    pub fn user_agent() -> String {
        "realm-sync/0.1".into()
    }
    pub fn timeout() -> u64 {
        10
    }

    // Pool defaults
    pub fn managed_tags() -> BTreeSet<String> {
        ["blizzard".to_string()].into_iter().collect()
    }
    pub fn error_threshold() -> u32 {
        100
    }
    pub fn cooldown() -> u64 {
        2 * 60 * 60
    }
    pub fn lease() -> u64 {
        10 * 60
    }
    pub fn refresh_margin() -> u64 {
        60 * 60
    }
    pub fn sweep_interval() -> u64 {
        60
    }

    // Scheduler defaults
    pub fn realm_staleness() -> u64 {
        24 * 60 * 60
    }
    pub fn batch_size() -> usize {
        500
    }
    pub fn item_id_range() -> (u64, u64) {
        (1, 200_000)
    }
    pub fn realm_interval() -> u64 {
        60 * 60
    }
    pub fn character_interval() -> u64 {
        7 * 24 * 60 * 60
    }
    pub fn guild_interval() -> u64 {
        24 * 60 * 60
    }
    pub fn item_interval() -> u64 {
        7 * 24 * 60 * 60
    }
    pub fn auction_interval() -> u64 {
        60 * 60
    }
    pub fn commodity_lock_ttl() -> u64 {
        15 * 60
    }
    pub fn bulk_priority() -> u8 {
        10
    }
    pub fn demand_priority() -> u8 {
        1
    }
    pub fn clearance() -> String {
        "blizzard".into()
    }

    // Reconciler defaults
    pub fn character_force_update() -> u64 {
        60 * 60
    }
    pub fn guild_force_update() -> u64 {
        60 * 60
    }

    // Worker defaults
    pub fn max_concurrent() -> usize {
        5
    }
    pub fn job_timeout() -> u64 {
        60
    }
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn retry_backoff() -> u64 {
        30
    }
    pub fn idle_poll() -> u64 {
        1_000
    }

    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }
}
