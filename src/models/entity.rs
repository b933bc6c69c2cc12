// src/models/entity.rs

//! Characters and guilds tracked against the upstream API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::audit::WatchedField;
use crate::models::status::{CharacterStatus, GuildStatus};
use crate::utils;

/// Rank number held by the guild master.
pub const MASTER_RANK: u8 = 0;

/// Behaviour shared by every entity the reconciler and auditor handle.
pub trait TrackedEntity: Clone + Send + Sync {
    /// Human-readable kind used in logs and errors.
    const KIND: &'static str;

    fn guid(&self) -> &str;

    /// Last time this core refreshed the record.
    fn updated_at(&self) -> DateTime<Utc>;

    /// Last time upstream reported a modification.
    fn last_modified(&self) -> DateTime<Utc>;

    /// Clear the per-fetch progress marker before a new refresh.
    fn reset_status(&mut self);

    /// Watched attributes with their current values.
    fn watched_fields(&self) -> Vec<(WatchedField, Option<&str>)>;
}

/// A player character.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    /// `name@realm-slug`
    pub guid: String,

    /// Upstream numeric id; unknown until the first successful fetch
    #[serde(default)]
    pub id: Option<u64>,

    pub name: String,
    pub realm: String,
    pub realm_id: u32,
    pub realm_name: String,

    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub race: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub faction: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,

    #[serde(default)]
    pub guild_guid: Option<String>,
    #[serde(default)]
    pub guild_rank: Option<u8>,

    /// Account-lineage identifier derived from collections
    #[serde(default)]
    pub family_hash: Option<String>,

    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub professions: Vec<String>,

    /// Who registered this record (e.g. "roster", "request", "resync")
    pub source: String,

    pub status: CharacterStatus,
    pub last_modified: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Character {
    /// A fresh, never-fetched record.
    pub fn new(
        name: &str,
        realm_slug: &str,
        realm_id: u32,
        realm_name: &str,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guid: utils::guid(name, realm_slug),
            id: None,
            name: utils::canonical_name(name),
            realm: realm_slug.to_string(),
            realm_id,
            realm_name: realm_name.to_string(),
            class: None,
            race: None,
            gender: None,
            faction: None,
            level: None,
            guild_guid: None,
            guild_rank: None,
            family_hash: None,
            avatar: None,
            professions: Vec::new(),
            source: source.into(),
            status: CharacterStatus::pending(),
            last_modified: now,
            updated_at: now,
            created_at: now,
        }
    }

    /// Recompute `guid` from the current name and realm; returns the previous guid if it changed.
    pub fn rekey(&mut self) -> Option<String> {
        let fresh = utils::guid(&self.name, &self.realm);
        if fresh == self.guid {
            None
        } else {
            Some(std::mem::replace(&mut self.guid, fresh))
        }
    }
}

impl TrackedEntity for Character {
    const KIND: &'static str = "character";

    fn guid(&self) -> &str {
        &self.guid
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    fn reset_status(&mut self) {
        self.status = CharacterStatus::pending();
    }

    fn watched_fields(&self) -> Vec<(WatchedField, Option<&str>)> {
        vec![
            (WatchedField::Name, Some(self.name.as_str())),
            (WatchedField::Race, self.race.as_deref()),
            (WatchedField::Gender, self.gender.as_deref()),
            (WatchedField::Faction, self.faction.as_deref()),
        ]
    }
}

/// A roster row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuildMember {
    pub id: u64,
    pub guid: String,
    pub name: String,
    pub realm: String,
    pub rank: u8,
}

/// A guild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guild {
    /// `name@realm-slug`
    pub guid: String,

    #[serde(default)]
    pub id: Option<u64>,

    pub name: String,
    pub realm: String,
    pub realm_id: u32,
    pub realm_name: String,

    #[serde(default)]
    pub faction: Option<String>,
    #[serde(default)]
    pub achievement_points: Option<u64>,
    #[serde(default)]
    pub members: Vec<GuildMember>,

    pub source: String,

    pub status: GuildStatus,
    pub last_modified: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Guild {
    pub fn new(
        name: &str,
        realm_slug: &str,
        realm_id: u32,
        realm_name: &str,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guid: utils::guid(name, realm_slug),
            id: None,
            name: name.trim().to_string(),
            realm: realm_slug.to_string(),
            realm_id,
            realm_name: realm_name.to_string(),
            faction: None,
            achievement_points: None,
            members: Vec::new(),
            source: source.into(),
            status: GuildStatus::pending(),
            last_modified: now,
            updated_at: now,
            created_at: now,
        }
    }

    /// The roster row holding the master rank.
    pub fn master(&self) -> Option<&GuildMember> {
        master_of(&self.members)
    }

    /// Recompute `guid` after a rename or realm transfer; returns the previous guid if it changed.
    pub fn rekey(&mut self) -> Option<String> {
        let fresh = utils::guid(&self.name, &self.realm);
        (fresh != self.guid).then(|| std::mem::replace(&mut self.guid, fresh))
    }
}

/// The member holding the master rank in a roster.
pub fn master_of(members: &[GuildMember]) -> Option<&GuildMember> {
    members.iter().find(|m| m.rank == MASTER_RANK)
}

impl TrackedEntity for Guild {
    const KIND: &'static str = "guild";

    fn guid(&self) -> &str {
        &self.guid
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    fn reset_status(&mut self) {
        self.status = GuildStatus::pending();
    }

    fn watched_fields(&self) -> Vec<(WatchedField, Option<&str>)> {
        vec![
            (WatchedField::Name, Some(self.name.as_str())),
            (WatchedField::Faction, self.faction.as_deref()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_character_is_canonical() {
        let now = Utc::now();
        let c = Character::new("iNERIUS", "gordunni", 1602, "Gordunni", "request", now);
        assert_eq!(c.guid, "inerius@gordunni");
        assert_eq!(c.name, "Inerius");
        assert_eq!(c.status.to_string(), "------");
    }

    #[test]
    fn test_rekey_on_rename() {
        let now = Utc::now();
        let mut c = Character::new("Inerius", "gordunni", 1602, "Gordunni", "request", now);
        assert_eq!(c.rekey(), None);

        c.name = "Blinkus".to_string();
        assert_eq!(c.rekey().as_deref(), Some("inerius@gordunni"));
        assert_eq!(c.guid, "blinkus@gordunni");
    }

    #[test]
    fn test_guild_rekey_on_transfer() {
        let mut g = Guild::new("Depo", "gordunni", 1602, "Gordunni", "request", Utc::now());
        assert_eq!(g.rekey(), None);

        g.realm = "howling-fjord".to_string();
        assert_eq!(g.rekey().as_deref(), Some("depo@gordunni"));
        assert_eq!(g.guid, "depo@howling-fjord");
    }

    #[test]
    fn test_guild_master_lookup() {
        let now = Utc::now();
        let mut g = Guild::new("Depo", "gordunni", 1602, "Gordunni", "request", now);
        assert!(g.master().is_none());
        g.members = vec![
            GuildMember {
                id: 2,
                guid: "b@gordunni".into(),
                name: "B".into(),
                realm: "gordunni".into(),
                rank: 3,
            },
            GuildMember {
                id: 1,
                guid: "a@gordunni".into(),
                name: "A".into(),
                realm: "gordunni".into(),
                rank: MASTER_RANK,
            },
        ];
        assert_eq!(g.master().map(|m| m.id), Some(1));
    }
}
