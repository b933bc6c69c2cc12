//! Local filesystem storage implementation.
//!
//! Collections are held in memory behind a single async mutex and written back to disk
//! atomically (temp file, then rename) after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{AuditLogEntry, Character, Guild, Realm};
use crate::storage::EntityStore;
use crate::utils;

const CHARACTERS: &str = "characters.json";
const GUILDS: &str = "guilds.json";
const REALMS: &str = "realms.json";
const AUDIT: &str = "audit.json";

#[derive(Default)]
struct State {
    characters: BTreeMap<String, Character>,
    guilds: BTreeMap<String, Guild>,
    realms: BTreeMap<u32, Realm>,
    audit: Vec<AuditLogEntry>,
}

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    state: Mutex<State>,
}

impl LocalStorage {
    /// Open (or create) a store rooted at the given directory.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;

        let characters: Vec<Character> = read_json(&root_dir.join(CHARACTERS))
            .await?
            .unwrap_or_default();
        let guilds: Vec<Guild> = read_json(&root_dir.join(GUILDS)).await?.unwrap_or_default();
        let realms: Vec<Realm> = read_json(&root_dir.join(REALMS)).await?.unwrap_or_default();
        let audit: Vec<AuditLogEntry> = read_json(&root_dir.join(AUDIT)).await?.unwrap_or_default();

        log::debug!(
            "Opened store at {}: {} characters, {} guilds, {} realms, {} audit entries",
            root_dir.display(),
            characters.len(),
            guilds.len(),
            realms.len(),
            audit.len()
        );

        let state = State {
            characters: characters.into_iter().map(|c| (c.guid.clone(), c)).collect(),
            guilds: guilds.into_iter().map(|g| (g.guid.clone(), g)).collect(),
            realms: realms.into_iter().map(|r| (r.id, r)).collect(),
            audit,
        };

        Ok(Self {
            root_dir,
            state: Mutex::new(state),
        })
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    async fn persist<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        write_json(&self.path(key), value).await
    }

    fn snapshot_key(collection: &str, key: &str) -> Result<String> {
        let collection = utils::to_slug(collection);
        let key = utils::to_slug(key);
        if collection.is_empty() || key.is_empty() || key.contains('/') {
            return Err(AppError::validation(format!(
                "invalid snapshot key {collection}/{key}"
            )));
        }
        Ok(format!("snapshots/{collection}/{key}.json"))
    }
}

/// Write bytes atomically (write to temp, then rename).
async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &bytes).await
}

/// Read JSON data, returning None if the file doesn't exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Io(e)),
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

#[async_trait]
impl EntityStore for LocalStorage {
    async fn get_character(&self, guid: &str) -> Result<Option<Character>> {
        Ok(self.state.lock().await.characters.get(guid).cloned())
    }

    async fn find_character_by_id(&self, id: u64) -> Result<Option<Character>> {
        let state = self.state.lock().await;
        Ok(state
            .characters
            .values()
            .filter(|c| c.id == Some(id))
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn upsert_character(&self, character: &Character) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .characters
            .insert(character.guid.clone(), character.clone());
        let all: Vec<&Character> = state.characters.values().collect();
        self.persist(CHARACTERS, &all).await
    }

    async fn scan_characters(&self, offset: usize, limit: usize) -> Result<Vec<Character>> {
        let state = self.state.lock().await;
        Ok(page(state.characters.values().cloned(), offset, limit))
    }

    async fn get_guild(&self, guid: &str) -> Result<Option<Guild>> {
        Ok(self.state.lock().await.guilds.get(guid).cloned())
    }

    async fn find_guild_by_id(&self, id: u64) -> Result<Option<Guild>> {
        let state = self.state.lock().await;
        Ok(state
            .guilds
            .values()
            .filter(|g| g.id == Some(id))
            .max_by_key(|g| g.updated_at)
            .cloned())
    }

    async fn upsert_guild(&self, guild: &Guild) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guilds.insert(guild.guid.clone(), guild.clone());
        let all: Vec<&Guild> = state.guilds.values().collect();
        self.persist(GUILDS, &all).await
    }

    async fn scan_guilds(&self, offset: usize, limit: usize) -> Result<Vec<Guild>> {
        let state = self.state.lock().await;
        Ok(page(state.guilds.values().cloned(), offset, limit))
    }

    async fn list_realms(&self) -> Result<Vec<Realm>> {
        Ok(self.state.lock().await.realms.values().cloned().collect())
    }

    async fn upsert_realm(&self, realm: &Realm) -> Result<()> {
        let mut state = self.state.lock().await;
        state.realms.insert(realm.id, realm.clone());
        let all: Vec<&Realm> = state.realms.values().collect();
        self.persist(REALMS, &all).await
    }

    async fn append_audit(&self, entries: &[AuditLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state.audit.extend_from_slice(entries);
        self.persist(AUDIT, &state.audit).await
    }

    async fn audit_for(&self, guid: &str) -> Result<Vec<AuditLogEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<AuditLogEntry> = state
            .audit
            .iter()
            .filter(|e| e.entity_guid == guid)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn rewrite_audit_guid(&self, old_guid: &str, new_guid: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut moved = 0;
        for entry in state.audit.iter_mut().filter(|e| e.entity_guid == old_guid) {
            entry.entity_guid = new_guid.to_string();
            moved += 1;
        }
        if moved > 0 {
            self.persist(AUDIT, &state.audit).await?;
        }
        Ok(moved)
    }

    async fn put_snapshot(
        &self,
        collection: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let key = Self::snapshot_key(collection, key)?;
        self.persist(&key, value).await
    }

    async fn get_snapshot(&self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let key = Self::snapshot_key(collection, key)?;
        read_json(&self.path(&key)).await
    }
}
