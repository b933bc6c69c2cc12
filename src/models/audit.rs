// src/models/audit.rs

//! Append-only audit log entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attributes whose changes are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedField {
    Name,
    Race,
    Gender,
    Faction,
}

impl WatchedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Race => "race",
            Self::Gender => "gender",
            Self::Faction => "faction",
        }
    }
}

/// How guild leadership changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterTransition {
    /// Passed between characters of the same account lineage
    Inherit,
    /// Passed to a character of a different account lineage
    Ownership,
    /// At least one side could not be resolved to a character record
    Transit,
}

/// Which side of a leadership transition an entry is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterRole {
    /// Entry anchored to the previous guild master
    Demoted,
    /// Entry anchored to the new guild master
    Promoted,
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    Field {
        field: WatchedField,
    },
    GuildMaster {
        transition: MasterTransition,
        role: MasterRole,
    },
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field { field } => f.write_str(field.as_str()),
            Self::GuildMaster { transition, role } => {
                write!(f, "guild_master:{transition:?}:{role:?}")
            }
        }
    }
}

/// One observed change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    /// Entity the change is queryable under
    pub entity_guid: String,
    pub action: AuditAction,
    pub original: String,
    pub updated: String,
    /// When the previous value was observed upstream
    pub scanned_at: DateTime<Utc>,
    /// When the new value was observed upstream; entries are ordered by this
    pub created_at: DateTime<Utc>,
}
