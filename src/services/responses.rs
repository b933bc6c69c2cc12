// src/services/responses.rs

//! Typed views of the upstream JSON documents the workers merge.
//!
//! Only the fields the engine uses are modelled; everything else is ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

/// `{ "name": "..." }` reference as returned with a locale parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRef {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealmRef {
    pub id: u32,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterStatusResponse {
    pub id: u64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRef {
    pub name: String,
    pub realm: RealmRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterSummaryResponse {
    pub id: u64,
    pub name: String,
    pub realm: RealmRef,
    #[serde(default)]
    pub gender: Option<NamedRef>,
    #[serde(default)]
    pub faction: Option<NamedRef>,
    #[serde(default)]
    pub race: Option<NamedRef>,
    #[serde(default)]
    pub character_class: Option<NamedRef>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub guild: Option<GuildRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaAsset {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterMediaResponse {
    #[serde(default)]
    pub assets: Vec<MediaAsset>,
}

impl CharacterMediaResponse {
    pub fn avatar(&self) -> Option<String> {
        self.assets
            .iter()
            .find(|a| a.key == "avatar")
            .map(|a| a.value.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountEntry {
    pub mount: IdRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterMountsResponse {
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PetEntry {
    pub species: IdRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterPetsResponse {
    #[serde(default)]
    pub pets: Vec<PetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfessionEntry {
    pub profession: NamedRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterProfessionsResponse {
    #[serde(default)]
    pub primaries: Vec<ProfessionEntry>,
    #[serde(default)]
    pub secondaries: Vec<ProfessionEntry>,
}

impl CharacterProfessionsResponse {
    pub fn names(&self) -> Vec<String> {
        self.primaries
            .iter()
            .chain(&self.secondaries)
            .map(|p| p.profession.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildSummaryResponse {
    pub id: u64,
    pub name: String,
    pub realm: RealmRef,
    #[serde(default)]
    pub faction: Option<NamedRef>,
    #[serde(default)]
    pub achievement_points: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildAchievementsResponse {
    #[serde(default)]
    pub total_points: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterCharacter {
    pub id: u64,
    pub name: String,
    pub realm: RealmRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    pub character: RosterCharacter,
    pub rank: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRosterResponse {
    #[serde(default)]
    pub members: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Href {
    pub href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealmResponse {
    pub id: u32,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub connected_realm: Option<Href>,
}

impl RealmResponse {
    /// Connected-realm id parsed from the link upstream provides.
    pub fn connected_realm_id(&self) -> Option<u32> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"connected-realm/(\d+)").expect("static regex"));
        let href = &self.connected_realm.as_ref()?.href;
        re.captures(href)?.get(1)?.as_str().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_ignores_unknown_fields() {
        let summary: CharacterSummaryResponse = serde_json::from_value(json!({
            "id": 1,
            "name": "Inerius",
            "realm": { "id": 1602, "slug": "gordunni", "name": "Gordunni" },
            "faction": { "type": "HORDE", "name": "Horde" },
            "achievement_points": 12000
        }))
        .unwrap();
        assert_eq!(summary.faction.unwrap().name, "Horde");
        assert!(summary.race.is_none());
    }

    #[test]
    fn test_connected_realm_id() {
        let realm: RealmResponse = serde_json::from_value(json!({
            "id": 1602,
            "slug": "gordunni",
            "name": "Gordunni",
            "connected_realm": {
                "href": "https://eu.api.blizzard.com/data/wow/connected-realm/1602?namespace=dynamic-eu"
            }
        }))
        .unwrap();
        assert_eq!(realm.connected_realm_id(), Some(1602));
    }

    #[test]
    fn test_media_avatar() {
        let media: CharacterMediaResponse = serde_json::from_value(json!({
            "assets": [
                { "key": "inset", "value": "https://render/inset.jpg" },
                { "key": "avatar", "value": "https://render/avatar.jpg" }
            ]
        }))
        .unwrap();
        assert_eq!(media.avatar().as_deref(), Some("https://render/avatar.jpg"));
    }
}
