// src/models/realm.rs

//! Realm reference records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A game realm as ingested from the upstream realm index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Realm {
    /// Upstream numeric id
    pub id: u32,

    /// URL slug (e.g., "blades-edge")
    pub slug: String,

    /// Canonical English name (e.g., "Blade's Edge")
    pub name: String,

    /// Localized display name (e.g., "Гордунни")
    #[serde(default)]
    pub locale_name: Option<String>,

    /// Slug of the localized name
    #[serde(default)]
    pub locale_slug: Option<String>,

    /// Connected-realm group this realm shares auctions with
    #[serde(default)]
    pub connected_realm_id: Option<u32>,

    /// Other spellings that should resolve to this realm
    #[serde(default)]
    pub aliases: Vec<String>,

    /// When this record was last refreshed from upstream
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Realm {
    pub fn new(id: u32, slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            slug: slug.into(),
            name: name.into(),
            locale_name: None,
            locale_slug: None,
            connected_realm_id: None,
            aliases: Vec::new(),
            updated_at: None,
        }
    }

    /// Whether the record is older than `offset` at `now` (never-refreshed realms are stale).
    pub fn is_stale(&self, now: DateTime<Utc>, offset: chrono::Duration) -> bool {
        self.updated_at.is_none_or(|at| at < now - offset)
    }
}
