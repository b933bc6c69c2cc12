//! Service layer for the sync engine.
//!
//! This module contains the business logic for:
//! - Credential rotation and circuit breaking (`CredentialPool`)
//! - Realm resolution (`RealmDirectory`)
//! - Upstream data and token clients (`BattleNetClient`, `OAuthClient`)
//! - Create/skip/refresh decisions (`EntityReconciler`)
//! - Audit trail generation (`ChangeAuditor`)

pub mod api;
pub mod auditor;
mod credentials;
mod realms;
mod reconciler;
pub mod responses;

pub use api::{ApiRequest, ApiResponse, BattleNetClient, DataProvider, OAuthClient, TokenExchange};
pub use auditor::ChangeAuditor;
pub use credentials::{CredentialPool, SweepReport};
pub use realms::RealmDirectory;
pub use reconciler::{EntityReconciler, ReconcileOutcome, Reconciled};
