// src/services/auditor.rs

//! Change auditor.
//!
//! Turns before/after snapshots into append-only audit entries. Guild leadership changes are
//! written as a pair so the transition can be looked up from either character.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AuditAction, AuditLogEntry, Character, Guild, GuildMember, MasterRole, MasterTransition,
    TrackedEntity, master_of,
};
use crate::storage::EntityStore;

/// Field-level diff of two snapshots of the same entity.
///
/// Only watched fields that are set on both sides and differ produce an entry.
pub fn diff<T: TrackedEntity>(original: &T, updated: &T) -> Vec<AuditLogEntry> {
    original
        .watched_fields()
        .into_iter()
        .zip(updated.watched_fields())
        .filter_map(|((field, before), (_, after))| match (before, after) {
            (Some(before), Some(after)) if before != after => Some(AuditLogEntry {
                entity_guid: updated.guid().to_string(),
                action: AuditAction::Field { field },
                original: before.to_string(),
                updated: after.to_string(),
                scanned_at: original.last_modified(),
                created_at: updated.last_modified(),
            }),
            _ => None,
        })
        .collect()
}

/// How leadership moved between two resolved (or unresolved) characters.
pub fn classify_transition(
    previous: Option<&Character>,
    next: Option<&Character>,
) -> MasterTransition {
    match (previous, next) {
        (Some(previous), Some(next)) => match (&previous.family_hash, &next.family_hash) {
            (Some(a), Some(b)) if a == b => MasterTransition::Inherit,
            _ => MasterTransition::Ownership,
        },
        _ => MasterTransition::Transit,
    }
}

pub struct ChangeAuditor {
    store: Arc<dyn EntityStore>,
}

impl ChangeAuditor {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Diff two snapshots and append whatever changed; returns the number of entries written.
    pub async fn diff_and_log<T: TrackedEntity>(&self, original: &T, updated: &T) -> Result<usize> {
        let entries = diff(original, updated);
        if entries.is_empty() {
            return Ok(0);
        }
        for entry in &entries {
            log::info!(
                "{} {}: {} '{}' -> '{}'",
                T::KIND,
                entry.entity_guid,
                entry.action,
                entry.original,
                entry.updated
            );
        }
        self.store.append_audit(&entries).await?;
        Ok(entries.len())
    }

    /// Compare the stored guild master against the master of a freshly fetched roster.
    pub async fn detect_guild_master_change(
        &self,
        guild: &Guild,
        new_roster: &[GuildMember],
    ) -> Result<Vec<AuditLogEntry>> {
        self.detect_guild_master_change_at(guild, new_roster, Utc::now())
            .await
    }

    /// As [`Self::detect_guild_master_change`], with `observed_at` as the new roster's timestamp.
    pub async fn detect_guild_master_change_at(
        &self,
        guild: &Guild,
        new_roster: &[GuildMember],
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>> {
        let (Some(previous), Some(next)) = (guild.master(), master_of(new_roster)) else {
            return Ok(Vec::new());
        };
        if previous.id == next.id {
            return Ok(Vec::new());
        }

        let previous_character = self.store.find_character_by_id(previous.id).await?;
        let next_character = self.store.find_character_by_id(next.id).await?;
        let transition =
            classify_transition(previous_character.as_ref(), next_character.as_ref());

        let previous_guid = previous_character
            .as_ref()
            .map_or(previous.guid.as_str(), |c| c.guid.as_str());
        let next_guid = next_character
            .as_ref()
            .map_or(next.guid.as_str(), |c| c.guid.as_str());

        log::info!(
            "Guild {} master {:?}: {} -> {}",
            guild.guid,
            transition,
            previous_guid,
            next_guid
        );

        let entry = |anchor: &str, role| AuditLogEntry {
            entity_guid: anchor.to_string(),
            action: AuditAction::GuildMaster { transition, role },
            original: previous_guid.to_string(),
            updated: next_guid.to_string(),
            scanned_at: guild.last_modified,
            created_at: observed_at,
        };
        let entries = vec![
            entry(previous_guid, MasterRole::Demoted),
            entry(next_guid, MasterRole::Promoted),
        ];
        self.store.append_audit(&entries).await?;
        Ok(entries)
    }

    /// Move audit history to an entity's new guid after a rename.
    pub async fn rewrite_guid(&self, old_guid: &str, new_guid: &str) -> Result<usize> {
        let moved = self.store.rewrite_audit_guid(old_guid, new_guid).await?;
        if moved > 0 {
            log::info!("Re-anchored {} audit entries {} -> {}", moved, old_guid, new_guid);
        }
        Ok(moved)
    }
}
