// src/models/job.rs

//! Crawl jobs and their payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::credential::JobCredentials;
use crate::utils;

/// Job id of the shared commodity snapshot.
pub const COMMODITY_JOB_ID: &str = "COMMODITY";

/// Queue a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Characters,
    Guilds,
    Realms,
    Items,
    Auctions,
}

impl QueueKind {
    pub const COUNT: usize = 5;

    pub const ALL: [QueueKind; Self::COUNT] = [
        Self::Characters,
        Self::Guilds,
        Self::Realms,
        Self::Items,
        Self::Auctions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Characters => "characters",
            Self::Guilds => "guilds",
            Self::Realms => "realms",
            Self::Items => "items",
            Self::Auctions => "auctions",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh a single character.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterJob {
    pub name: String,
    /// Free-text realm; resolved through the realm directory
    pub realm: String,
    #[serde(default)]
    pub credentials: Option<JobCredentials>,
    /// Per-call staleness window override, in seconds
    #[serde(default)]
    pub force_update_secs: Option<u64>,
    /// Only register the character if it is missing; never refresh
    #[serde(default)]
    pub create_only_unique: bool,
    #[serde(default = "default_source")]
    pub source: String,
    /// Guild membership observed in a roster, if that is where the job came from
    #[serde(default)]
    pub guild_guid: Option<String>,
    #[serde(default)]
    pub guild_rank: Option<u8>,
}

impl CharacterJob {
    pub fn new(name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            realm: realm.into(),
            credentials: None,
            force_update_secs: None,
            create_only_unique: false,
            source: default_source(),
            guild_guid: None,
            guild_rank: None,
        }
    }
}

/// Refresh a single guild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuildJob {
    pub name: String,
    pub realm: String,
    #[serde(default)]
    pub credentials: Option<JobCredentials>,
    #[serde(default)]
    pub force_update_secs: Option<u64>,
    #[serde(default)]
    pub create_only_unique: bool,
    #[serde(default = "default_source")]
    pub source: String,
}

impl GuildJob {
    pub fn new(name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            realm: realm.into(),
            credentials: None,
            force_update_secs: None,
            create_only_unique: false,
            source: default_source(),
        }
    }
}

/// Refresh a realm record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealmJob {
    pub realm_id: u32,
    pub slug: String,
    #[serde(default)]
    pub credentials: Option<JobCredentials>,
}

/// Fetch an item record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemJob {
    pub item_id: u64,
    #[serde(default)]
    pub credentials: Option<JobCredentials>,
}

/// Which auction house snapshot to fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuctionTarget {
    ConnectedRealm(u32),
    /// Region-wide commodity snapshot; a singleton guarded by a lock
    Commodity,
}

/// Fetch an auction house snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuctionJob {
    pub target: AuctionTarget,
    #[serde(default)]
    pub credentials: Option<JobCredentials>,
}

/// Every kind of work the fetch workers understand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Character(CharacterJob),
    Guild(GuildJob),
    Realm(RealmJob),
    Item(ItemJob),
    Auction(AuctionJob),
}

impl JobPayload {
    /// Deterministic id derived from the payload's natural key.
    pub fn job_id(&self) -> String {
        match self {
            Self::Character(job) => utils::guid(&job.name, &job.realm),
            Self::Guild(job) => utils::guid(&job.name, &job.realm),
            Self::Realm(job) => job.realm_id.to_string(),
            Self::Item(job) => job.item_id.to_string(),
            Self::Auction(job) => match job.target {
                AuctionTarget::ConnectedRealm(id) => id.to_string(),
                AuctionTarget::Commodity => COMMODITY_JOB_ID.to_string(),
            },
        }
    }

    pub fn queue(&self) -> QueueKind {
        match self {
            Self::Character(_) => QueueKind::Characters,
            Self::Guild(_) => QueueKind::Guilds,
            Self::Realm(_) => QueueKind::Realms,
            Self::Item(_) => QueueKind::Items,
            Self::Auction(_) => QueueKind::Auctions,
        }
    }

    pub fn credentials(&self) -> Option<&JobCredentials> {
        match self {
            Self::Character(job) => job.credentials.as_ref(),
            Self::Guild(job) => job.credentials.as_ref(),
            Self::Realm(job) => job.credentials.as_ref(),
            Self::Item(job) => job.credentials.as_ref(),
            Self::Auction(job) => job.credentials.as_ref(),
        }
    }

    pub fn set_credentials(&mut self, credentials: JobCredentials) {
        let slot = match self {
            Self::Character(job) => &mut job.credentials,
            Self::Guild(job) => &mut job.credentials,
            Self::Realm(job) => &mut job.credentials,
            Self::Item(job) => &mut job.credentials,
            Self::Auction(job) => &mut job.credentials,
        };
        *slot = Some(credentials);
    }

    /// Free-text realm of a character or guild payload, for rewriting to its canonical slug.
    pub fn realm_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Character(job) => Some(&mut job.realm),
            Self::Guild(job) => Some(&mut job.realm),
            _ => None,
        }
    }

    /// Reject malformed payloads before they reach a queue.
    pub fn validate(&self) -> Result<()> {
        let named = |name: &str, realm: &str| {
            if utils::to_slug(name).is_empty() {
                return Err(AppError::validation(format!("empty name in {self:?}")));
            }
            if utils::to_slug(realm).is_empty() {
                return Err(AppError::validation(format!("empty realm in {self:?}")));
            }
            Ok(())
        };
        match self {
            Self::Character(job) => named(&job.name, &job.realm),
            Self::Guild(job) => named(&job.name, &job.realm),
            Self::Realm(job) if job.slug.trim().is_empty() => {
                Err(AppError::validation("realm job without slug"))
            }
            Self::Item(job) if job.item_id == 0 => Err(AppError::validation("item id 0")),
            _ => Ok(()),
        }
    }
}

/// A unit of work on a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlJob {
    pub id: String,
    pub payload: JobPayload,
    /// Lower runs first; advisory only
    pub priority: u8,
    #[serde(default)]
    pub attempts: u32,
}

impl CrawlJob {
    pub fn new(payload: JobPayload, priority: u8) -> Self {
        Self {
            id: payload.job_id(),
            payload,
            priority,
            attempts: 0,
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.payload.queue()
    }

    /// Fold a later enqueue of the same id into this pending job.
    ///
    /// The merged job is at least as eager as either side: a register-only request never
    /// downgrades a pending refresh, and the shorter staleness window wins.
    pub fn absorb(&mut self, newer: CrawlJob) {
        self.priority = self.priority.min(newer.priority);
        match (&mut self.payload, newer.payload) {
            (JobPayload::Character(old), JobPayload::Character(new)) => {
                if old.create_only_unique && !new.create_only_unique {
                    old.source = new.source;
                }
                old.create_only_unique &= new.create_only_unique;
                old.force_update_secs = eager_window(old.force_update_secs, new.force_update_secs);
                old.credentials = new.credentials.or(old.credentials.take());
                old.guild_guid = new.guild_guid.or(old.guild_guid.take());
                old.guild_rank = new.guild_rank.or(old.guild_rank);
            }
            (JobPayload::Guild(old), JobPayload::Guild(new)) => {
                if old.create_only_unique && !new.create_only_unique {
                    old.source = new.source;
                }
                old.create_only_unique &= new.create_only_unique;
                old.force_update_secs = eager_window(old.force_update_secs, new.force_update_secs);
                old.credentials = new.credentials.or(old.credentials.take());
            }
            (payload, new) => *payload = new,
        }
    }
}

/// Shorter of two staleness overrides; an explicit override beats the configured default.
fn eager_window(old: Option<u64>, new: Option<u64>) -> Option<u64> {
    match (old, new) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => b.or(a),
    }
}

fn default_source() -> String {
    "request".to_string()
}
