// src/services/realms.rs

//! Realm directory cache.
//!
//! Resolves free-text realm identifiers ("Blade's Edge", "blades-edge", "1602", "Гордунни")
//! to canonical realm records. The index is built from the store on first use and can be
//! rebuilt with [`RealmDirectory::reload`] after realm ingestion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};

use crate::error::Result;
use crate::models::Realm;
use crate::storage::EntityStore;
use crate::utils;

/// Key into the realm list.
type KeyMap = HashMap<String, usize>;

/// Immutable lookup tables over one realm snapshot.
#[derive(Debug, Default)]
struct RealmIndex {
    realms: Vec<Realm>,
    by_id: KeyMap,
    by_name: KeyMap,
    by_slug: KeyMap,
    by_locale_name: KeyMap,
    by_locale_slug: KeyMap,
}

impl RealmIndex {
    fn build(realms: Vec<Realm>) -> Self {
        let mut index = Self::default();
        for (i, realm) in realms.iter().enumerate() {
            insert(&mut index.by_id, &realm.id.to_string(), i);
            insert(&mut index.by_name, &realm.name, i);
            for alias in &realm.aliases {
                insert(&mut index.by_name, alias, i);
            }
            insert(&mut index.by_slug, &realm.slug, i);
            if let Some(name) = &realm.locale_name {
                insert(&mut index.by_locale_name, name, i);
            }
            if let Some(slug) = &realm.locale_slug {
                insert(&mut index.by_locale_slug, slug, i);
            }
        }
        index.realms = realms;
        index
    }

    fn maps(&self) -> [&KeyMap; 5] {
        [
            &self.by_id,
            &self.by_name,
            &self.by_slug,
            &self.by_locale_name,
            &self.by_locale_slug,
        ]
    }

    fn find_in(&self, maps: &[&KeyMap], key: &str) -> Option<&Realm> {
        maps.iter()
            .find_map(|m| m.get(key))
            .map(|&i| &self.realms[i])
    }

    /// Exact, then slug form against slug maps, then lowercase against everything.
    fn find(&self, query: &str) -> Option<&Realm> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }

        self.find_in(&self.maps(), query)
            .or_else(|| {
                let slug = utils::to_slug(query);
                self.find_in(&[&self.by_slug, &self.by_locale_slug], &slug)
            })
            .or_else(|| self.find_in(&self.maps(), &query.to_lowercase()))
    }
}

/// Insert under the original key and its lowercase form; first writer wins.
fn insert(map: &mut KeyMap, key: &str, index: usize) {
    map.entry(key.to_string()).or_insert(index);
    map.entry(key.to_lowercase()).or_insert(index);
}

/// Shared realm lookup service.
pub struct RealmDirectory {
    store: Arc<dyn EntityStore>,
    index: RwLock<Arc<RealmIndex>>,
    loaded: OnceCell<()>,
}

impl RealmDirectory {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            index: RwLock::new(Arc::new(RealmIndex::default())),
            loaded: OnceCell::new(),
        }
    }

    /// Resolve a realm by id, name, alias, slug or localized name.
    ///
    /// Waits for the initial load if it is still running. `Ok(None)` means no realm matched.
    pub async fn find_realm(&self, query: &str) -> Result<Option<Realm>> {
        let index = self.index().await?;
        let found = index.find(query).cloned();
        if found.is_none() {
            log::debug!("Realm '{}' not in directory", query);
        }
        Ok(found)
    }

    /// Every cached realm.
    pub async fn realms(&self) -> Result<Vec<Realm>> {
        Ok(self.index().await?.realms.clone())
    }

    /// Rebuild the index from the store; returns how many realms it holds.
    pub async fn reload(&self) -> Result<usize> {
        let realms = self.store.list_realms().await?;
        let count = realms.len();
        let index = Arc::new(RealmIndex::build(realms));
        *self.index.write().await = index;
        log::info!("Realm directory loaded ({} realms)", count);
        Ok(count)
    }

    async fn index(&self) -> Result<Arc<RealmIndex>> {
        self.loaded
            .get_or_try_init(|| async { self.reload().await.map(|_| ()) })
            .await?;
        Ok(self.index.read().await.clone())
    }
}
