// src/models/credential.rs

//! Upstream API credentials and their circuit state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    /// Usable by anyone holding the right clearance
    #[default]
    Free,
    /// Leased to a single consumer until `reset_at`
    Taken,
    /// Circuit open after repeated rate-limit responses
    TooManyRequests,
}

/// A client-credentials pair with its bearer token and error telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,

    /// Bearer token from the last successful token exchange
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Subsystems allowed to use this credential
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub status: CredentialStatus,

    #[serde(default)]
    pub error_counts: u32,

    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            access_token: None,
            expires_at: None,
            tags: tags.into_iter().map(Into::into).collect(),
            status: CredentialStatus::Free,
            error_counts: 0,
            reset_at: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Whether the token is missing or expires before `deadline`.
    pub fn token_expires_before(&self, deadline: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => expires_at <= deadline,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// The subset handed to workers inside a job payload.
    pub fn to_job_credentials(&self) -> JobCredentials {
        JobCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            access_token: self.access_token.clone().unwrap_or_default(),
        }
    }
}

/// Credentials carried by a crawl job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
}

/// Result of a client-credentials token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Lifetime in seconds
    pub expires_in: i64,
}
