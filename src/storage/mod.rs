//! Storage abstractions for tracked entities and their audit trail.
//!
//! The engine needs only point lookups, ordered range scans for resync batching, upserts and
//! an append-only audit log. `LocalStorage` keeps each collection in a JSON file:
//!
//! ```text
//! storage/
//! ├── characters.json
//! ├── guilds.json
//! ├── realms.json
//! ├── audit.json
//! └── snapshots/
//!     ├── items/{id}.json
//!     └── auctions/{id}.json
//! ```

pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AuditLogEntry, Character, Guild, Realm};

// Re-export for convenience
pub use local::LocalStorage;

/// Trait for persistent store backends.
///
/// No operation spans more than one entity; callers get best-effort convergence, not
/// transactions.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_character(&self, guid: &str) -> Result<Option<Character>>;

    /// Look a character up by its upstream numeric id.
    async fn find_character_by_id(&self, id: u64) -> Result<Option<Character>>;

    async fn upsert_character(&self, character: &Character) -> Result<()>;

    /// Page of characters ordered by guid.
    async fn scan_characters(&self, offset: usize, limit: usize) -> Result<Vec<Character>>;

    async fn get_guild(&self, guid: &str) -> Result<Option<Guild>>;

    /// Look a guild up by its upstream numeric id.
    async fn find_guild_by_id(&self, id: u64) -> Result<Option<Guild>>;

    async fn upsert_guild(&self, guild: &Guild) -> Result<()>;

    /// Page of guilds ordered by guid.
    async fn scan_guilds(&self, offset: usize, limit: usize) -> Result<Vec<Guild>>;

    async fn list_realms(&self) -> Result<Vec<Realm>>;

    async fn upsert_realm(&self, realm: &Realm) -> Result<()>;

    /// Append audit entries; existing entries are never modified except by guid rewrite.
    async fn append_audit(&self, entries: &[AuditLogEntry]) -> Result<()>;

    /// Entries anchored to `guid`, ordered by `created_at`.
    async fn audit_for(&self, guid: &str) -> Result<Vec<AuditLogEntry>>;

    /// Re-anchor every entry of `old_guid` to `new_guid`; returns how many moved.
    async fn rewrite_audit_guid(&self, old_guid: &str, new_guid: &str) -> Result<usize>;

    /// Store a raw upstream document (items, auction snapshots).
    async fn put_snapshot(&self, collection: &str, key: &str, value: &serde_json::Value)
    -> Result<()>;

    async fn get_snapshot(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>>;
}
