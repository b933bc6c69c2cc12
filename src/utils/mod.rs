//! Utility functions and helpers.

pub mod http;

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

/// Characters that never survive slugging.
fn strip_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"['`’"\.,:;!?()\[\]{}@/\\#\&+%*=<>|\~^$]+"#).expect("static regex")
    })
}

/// Runs of whitespace, underscores and hyphens collapse into a single hyphen.
fn separator_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s_\-]+").expect("static regex"))
}

/// Convert free text into a lowercase, URL-safe slug.
///
/// `"Blade's Edge"` becomes `"blades-edge"`, `"Азурегос"` becomes `"азурегос"`.
pub fn to_slug(s: &str) -> String {
    let stripped = strip_pattern().replace_all(s.trim(), "");
    let joined = separator_pattern().replace_all(&stripped, "-");
    joined.trim_matches('-').to_lowercase()
}

/// Canonical identity of a tracked entity: `slug(name)@slug(realm)`.
///
/// Pure function of its inputs; every dedup guarantee relies on it.
pub fn guid(name: &str, realm: &str) -> String {
    format!("{}@{}", to_slug(name), to_slug(realm))
}

/// Capitalize the first grapheme and lowercase the rest, the way names are displayed in-game.
pub fn canonical_name(name: &str) -> String {
    let mut graphemes = name.trim().graphemes(true);
    match graphemes.next() {
        Some(first) => {
            let rest: String = graphemes.collect();
            format!("{}{}", first.to_uppercase(), rest.to_lowercase())
        }
        None => String::new(),
    }
}

/// Derive an account-lineage identifier from collection ids shared across an account.
///
/// Order-insensitive; returns `None` for an empty collection since it identifies nothing.
pub fn family_hash(collection_ids: &[u64]) -> Option<String> {
    if collection_ids.is_empty() {
        return None;
    }
    let mut ids = collection_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.to_be_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    Some(digest[..16].to_string())
}
