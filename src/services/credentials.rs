// src/services/credentials.rs

//! Credential pool with per-credential circuit breaking.
//!
//! Credentials move between three states:
//!
//! ```text
//!            acquire()                 error_counts > threshold (sweep)
//!   FREE ─────────────▶ TAKEN        FREE/TAKEN ─────────────▶ TOO_MANY_REQUESTS
//!     ▲                   │                                        │
//!     └──── reset_at elapsed (sweep): error_counts = 0 ◀───────────┘
//! ```
//!
//! Selection never blocks: when nothing eligible remains the caller gets
//! `AppError::PoolExhausted` and fails its job.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{Credential, CredentialStatus, PoolConfig};
use crate::services::api::TokenExchange;

/// What a sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Circuits closed or leases expired
    pub reset: usize,
    /// Circuits opened
    pub tripped: usize,
}

/// Owns every credential; the only place credential state is mutated.
pub struct CredentialPool {
    config: PoolConfig,
    credentials: RwLock<Vec<Credential>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(config: PoolConfig, credentials: Vec<Credential>) -> Self {
        Self {
            config,
            credentials: RwLock::new(credentials),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick a usable credential carrying `tag`, rotating across the eligible set.
    ///
    /// `TOO_MANY_REQUESTS` credentials are never returned; `TAKEN` ones only when
    /// `exclude_taken` is false.
    pub async fn select(&self, tag: &str, exclude_taken: bool) -> Result<Credential> {
        let credentials = self.credentials.read().await;
        let index = self.pick(&credentials, tag, exclude_taken)?;
        Ok(credentials[index].clone())
    }

    /// Lease a credential exclusively until released or the lease runs out.
    pub async fn acquire(&self, tag: &str) -> Result<Credential> {
        let mut credentials = self.credentials.write().await;
        let index = self.pick(&credentials, tag, true)?;
        let credential = &mut credentials[index];
        credential.status = CredentialStatus::Taken;
        credential.reset_at = Some(Utc::now() + secs(self.config.lease_secs));
        log::debug!("Credential {} leased", credential.client_id);
        Ok(credential.clone())
    }

    /// End a lease early.
    pub async fn release(&self, client_id: &str) {
        let mut credentials = self.credentials.write().await;
        if let Some(c) = credentials
            .iter_mut()
            .find(|c| c.client_id == client_id && c.status == CredentialStatus::Taken)
        {
            c.status = CredentialStatus::Free;
            c.reset_at = None;
        }
    }

    /// Count an upstream rate-limit response against a credential.
    pub async fn record_error(&self, client_id: &str) {
        let mut credentials = self.credentials.write().await;
        match credentials.iter_mut().find(|c| c.client_id == client_id) {
            Some(c) => {
                c.error_counts = c.error_counts.saturating_add(1);
                log::debug!("Credential {} error count {}", client_id, c.error_counts);
            }
            None => log::warn!("Rate limit reported for unknown credential {}", client_id),
        }
    }

    /// Periodic circuit maintenance over credentials with a managed clearance.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut credentials = self.credentials.write().await;

        for c in credentials.iter_mut().filter(|c| self.is_managed(c)) {
            if c.status != CredentialStatus::Free && c.reset_at.is_some_and(|at| at <= now) {
                log::info!("Credential {} back to FREE (was {:?})", c.client_id, c.status);
                c.error_counts = 0;
                c.status = CredentialStatus::Free;
                c.reset_at = None;
                report.reset += 1;
            }

            if c.error_counts > self.config.error_threshold
                && c.status != CredentialStatus::TooManyRequests
            {
                log::warn!(
                    "Credential {} tripped after {} errors; cooling down for {}s",
                    c.client_id,
                    c.error_counts,
                    self.config.cooldown_secs
                );
                c.status = CredentialStatus::TooManyRequests;
                c.reset_at = Some(now + secs(self.config.cooldown_secs));
                report.tripped += 1;
            }
        }
        report
    }

    /// Re-authenticate one credential against the token endpoint.
    ///
    /// On failure the credential keeps its last good token; the next sweep tries again.
    pub async fn refresh(&self, client_id: &str, auth: &dyn TokenExchange) -> Result<Credential> {
        let secret = {
            let credentials = self.credentials.read().await;
            credentials
                .iter()
                .find(|c| c.client_id == client_id)
                .map(|c| c.client_secret.clone())
                .ok_or_else(|| AppError::not_found(format!("credential {client_id}")))?
        };

        let token = auth.exchange(client_id, &secret).await.inspect_err(|e| {
            log::warn!("Token refresh failed for {}: {}", client_id, e);
        })?;

        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .iter_mut()
            .find(|c| c.client_id == client_id)
            .ok_or_else(|| AppError::not_found(format!("credential {client_id}")))?;
        credential.access_token = Some(token.access_token);
        credential.expires_at = Some(Utc::now() + Duration::seconds(token.expires_in));
        log::info!("Credential {} refreshed", client_id);
        Ok(credential.clone())
    }

    /// Refresh every managed credential whose token is missing or about to expire.
    ///
    /// Returns how many refreshes succeeded; failures are logged and left for the next sweep.
    pub async fn refresh_expiring(&self, auth: &dyn TokenExchange) -> usize {
        let deadline = Utc::now() + secs(self.config.refresh_margin_secs);
        let due: Vec<String> = self
            .credentials
            .read()
            .await
            .iter()
            .filter(|c| self.is_managed(c) && c.token_expires_before(deadline))
            .map(|c| c.client_id.clone())
            .collect();

        let mut refreshed = 0;
        for client_id in due {
            if self.refresh(&client_id, auth).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Copy of the current pool state.
    pub async fn snapshot(&self) -> Vec<Credential> {
        self.credentials.read().await.clone()
    }

    /// Current state of one credential, if it is free for shared use and holds a token.
    pub async fn usable(&self, client_id: &str) -> Option<Credential> {
        self.credentials
            .read()
            .await
            .iter()
            .find(|c| {
                c.client_id == client_id
                    && c.status == CredentialStatus::Free
                    && c.access_token.is_some()
            })
            .cloned()
    }

    fn is_managed(&self, credential: &Credential) -> bool {
        credential
            .tags
            .iter()
            .any(|t| self.config.managed_tags.contains(t))
    }

    fn pick(&self, credentials: &[Credential], tag: &str, exclude_taken: bool) -> Result<usize> {
        let eligible: Vec<usize> = credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.has_tag(tag)
                    && c.status != CredentialStatus::TooManyRequests
                    && !(exclude_taken && c.status == CredentialStatus::Taken)
            })
            .map(|(i, _)| i)
            .collect();

        // Credentials holding a token go first; tokenless ones wait for the next refresh.
        let with_token: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|i| credentials[*i].access_token.is_some())
            .collect();
        let candidates = if with_token.is_empty() {
            eligible
        } else {
            with_token
        };

        if candidates.is_empty() {
            return Err(AppError::PoolExhausted(tag.to_string()));
        }
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[turn % candidates.len()])
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccessToken;
    use async_trait::async_trait;

    const TAG: &str = "blizzard";

    fn pool(creds: Vec<Credential>) -> CredentialPool {
        let config = PoolConfig {
            error_threshold: 3,
            ..PoolConfig::default()
        };
        CredentialPool::new(config, creds)
    }

    fn cred(id: &str) -> Credential {
        let mut c = Credential::new(id, "secret", [TAG]);
        c.access_token = Some(format!("token-{id}"));
        c
    }

    struct FixedToken;

    #[async_trait]
    impl TokenExchange for FixedToken {
        async fn exchange(&self, client_id: &str, _secret: &str) -> Result<AccessToken> {
            Ok(AccessToken {
                access_token: format!("fresh-{client_id}"),
                expires_in: 86_400,
            })
        }
    }

    struct FailingAuth;

    #[async_trait]
    impl TokenExchange for FailingAuth {
        async fn exchange(&self, _client_id: &str, _secret: &str) -> Result<AccessToken> {
            Err(AppError::transient("token exchange", "upstream answered 503"))
        }
    }

    #[tokio::test]
    async fn test_select_filters_by_tag_and_rotates() {
        let mut other = cred("other");
        other.tags = ["osint".to_string()].into_iter().collect();
        let p = pool(vec![cred("a"), other, cred("b")]);

        let first = p.select(TAG, false).await.unwrap().client_id;
        let second = p.select(TAG, false).await.unwrap().client_id;
        assert_ne!(first, second);
        assert!(["a", "b"].contains(&first.as_str()));
        assert_eq!(p.select("osint", false).await.unwrap().client_id, "other");
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_fast() {
        let p = pool(vec![cred("a")]);
        assert!(matches!(
            p.select("missing", false).await,
            Err(AppError::PoolExhausted(_))
        ));

        p.acquire(TAG).await.unwrap();
        assert!(matches!(
            p.acquire(TAG).await,
            Err(AppError::PoolExhausted(_))
        ));
        // Only callers that tolerate sharing still see the leased credential
        assert!(p.select(TAG, false).await.is_ok());
        assert!(p.select(TAG, true).await.is_err());
        assert!(p.usable("a").await.is_none());

        p.release("a").await;
        assert!(p.usable("a").await.is_some());
        assert!(p.acquire(TAG).await.is_ok());
    }

    #[tokio::test]
    async fn test_circuit_trips_and_resets_once() {
        let p = pool(vec![cred("a")]);
        for _ in 0..4 {
            p.record_error("a").await;
        }

        let now = Utc::now();
        assert_eq!(p.sweep_at(now).await.tripped, 1);
        let c = &p.snapshot().await[0];
        assert_eq!(c.status, CredentialStatus::TooManyRequests);
        assert_eq!(c.reset_at, Some(now + Duration::hours(2)));
        assert!(matches!(
            p.select(TAG, false).await,
            Err(AppError::PoolExhausted(_))
        ));

        // Still cooling down
        assert_eq!(p.sweep_at(now + Duration::hours(1)).await, SweepReport::default());

        let later = now + Duration::hours(2) + Duration::seconds(1);
        assert_eq!(p.sweep_at(later).await.reset, 1);
        let c = &p.snapshot().await[0];
        assert_eq!(c.status, CredentialStatus::Free);
        assert_eq!(c.error_counts, 0);

        // Nothing left to do
        assert_eq!(p.sweep_at(later).await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_at_threshold_does_not_trip() {
        let p = pool(vec![cred("a")]);
        for _ in 0..3 {
            p.record_error("a").await;
        }
        assert_eq!(p.sweep().await.tripped, 0);
    }

    #[tokio::test]
    async fn test_unmanaged_credentials_are_left_alone() {
        let mut c = Credential::new("x", "secret", ["osint"]);
        c.error_counts = 50;
        let p = pool(vec![c]);
        assert_eq!(p.sweep().await, SweepReport::default());
        assert_eq!(p.snapshot().await[0].status, CredentialStatus::Free);
    }

    #[tokio::test]
    async fn test_expired_lease_is_freed_by_sweep() {
        let p = pool(vec![cred("a")]);
        p.acquire(TAG).await.unwrap();
        let report = p.sweep_at(Utc::now() + Duration::hours(1)).await;
        assert_eq!(report.reset, 1);
        assert_eq!(p.snapshot().await[0].status, CredentialStatus::Free);
    }

    #[tokio::test]
    async fn test_refresh_updates_token() {
        let p = pool(vec![Credential::new("a", "secret", [TAG])]);
        assert_eq!(p.refresh_expiring(&FixedToken).await, 1);
        let c = &p.snapshot().await[0];
        assert_eq!(c.access_token.as_deref(), Some("fresh-a"));
        assert!(c.expires_at.is_some());
        // Fresh token is outside the refresh margin
        assert_eq!(p.refresh_expiring(&FixedToken).await, 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_good_state() {
        let mut c = cred("a");
        c.expires_at = Some(Utc::now() + Duration::minutes(5));
        let p = pool(vec![c]);

        assert!(p.refresh("a", &FailingAuth).await.is_err());
        assert_eq!(p.refresh_expiring(&FailingAuth).await, 0);
        let c = &p.snapshot().await[0];
        assert_eq!(c.access_token.as_deref(), Some("token-a"));
        assert_eq!(c.status, CredentialStatus::Free);
    }
}
