// src/models/mod.rs

//! Domain models for the sync engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod audit;
mod config;
mod credential;
mod entity;
mod job;
mod realm;
pub mod status;

// Re-export all public types
pub use audit::{AuditAction, AuditLogEntry, MasterRole, MasterTransition, WatchedField};
pub use config::{
    ApiConfig, Config, CredentialConfig, PathsConfig, PoolConfig, ReconcilerConfig,
    SchedulerConfig, WorkerConfig,
};
pub use credential::{AccessToken, Credential, CredentialStatus, JobCredentials};
pub use entity::{Character, Guild, GuildMember, MASTER_RANK, TrackedEntity, master_of};
pub use job::{
    AuctionJob, AuctionTarget, COMMODITY_JOB_ID, CharacterJob, CrawlJob, GuildJob, ItemJob,
    JobPayload, QueueKind, RealmJob,
};
pub use realm::Realm;
pub use status::{
    CharacterEndpoint, CharacterStatus, Endpoint, FetchStatus, GuildEndpoint, GuildStatus,
    SlotState,
};
