//! Credential store: the persistence boundary for accounts, verification tokens,
//! review decisions, refresh sessions, permission overrides and the permission matrix.
//!
//! Every method is one atomic operation against the backing store. Multi-row state
//! changes (token consumption, approval transitions, session revocation) happen inside a
//! single transaction or critical section so callers never observe a half-applied change.

mod memory;
mod postgres;

pub use memory::InMemoryCredentialStore;
pub use postgres::PgCredentialStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::utils::Retryable;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Account, ApprovalDecision, ApprovalState, Permission, PermissionOverride, RefreshSession,
    Role, VerificationToken,
};

/// Stored role -> permissions document. The admin role never appears in it.
pub type RolePermissionDocument = BTreeMap<Role, BTreeSet<Permission>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("login already taken")]
    LoginTaken,

    #[error("account not found")]
    AccountNotFound,

    #[error("permission matrix version conflict (expected {expected})")]
    VersionConflict { expected: i64 },

    #[error("store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("store error: {0}")]
    Internal(anyhow::Error),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of the atomic verification-token consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Verified {
        account_id: Uuid,
        approval_state: ApprovalState,
    },
    NotFound,
    Expired,
    AlreadyUsed,
    Superseded,
}

/// Result of a state-guarded approval transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Account),
    /// The account was not in the expected state; carries the state it is in.
    Conflict(ApprovalState),
    NotFound,
}

/// Requested approval transition, applied only if the account is still in `from`.
#[derive(Debug, Clone)]
pub struct ApprovalTransition {
    pub account_id: Uuid,
    pub from: ApprovalState,
    pub to: ApprovalState,
    pub decision: ApprovalDecision,
    /// Bump the session epoch and revoke refresh sessions in the same transaction.
    pub revoke_sessions: bool,
}

/// Decides the state an account enters once its email is verified.
pub type NextStateFn = dyn Fn(Role) -> ApprovalState + Send + Sync;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with `LoginTaken` when a non-rejected account already uses the login.
    /// Re-inserting an `account_id` that is already stored is a no-op, so a write retried
    /// after a lost commit acknowledgement still reports success.
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Case-insensitive. Prefers the live account; falls back to the latest rejected one.
    async fn find_account_by_login(&self, login: &str) -> Result<Option<Account>, StoreError>;

    /// Whether any non-rejected account holds `role`.
    async fn role_exists(&self, role: Role) -> Result<bool, StoreError>;

    async fn accounts_in_state(&self, state: ApprovalState) -> Result<Vec<Account>, StoreError>;

    async fn record_login(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn update_secret(&self, account_id: Uuid, secret_hash: &str) -> Result<(), StoreError>;

    /// Stores `token` and marks every earlier unconsumed token of the account superseded.
    async fn issue_verification_token(&self, token: &VerificationToken) -> Result<(), StoreError>;

    /// Check-and-set on the token. On success also sets `email_verified` and advances a
    /// `pending_email_verification` account to `next_state(role)`.
    ///
    /// Failures are reported in the order `NotFound`, `Expired`, `AlreadyUsed`,
    /// `Superseded`: an expired token reports `Expired` whatever else happened to it.
    async fn consume_verification_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        next_state: &NextStateFn,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Applies the transition if the account is still in `transition.from`. A transition
    /// whose decision row is already stored was applied earlier and reports `Applied` again.
    async fn transition_approval(
        &self,
        transition: &ApprovalTransition,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Review history, oldest first.
    async fn decisions_for(&self, account_id: Uuid) -> Result<Vec<ApprovalDecision>, StoreError>;

    async fn create_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError>;

    async fn find_refresh_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<RefreshSession>, StoreError>;

    /// Revokes the session if it is still live. Returns false when it was already revoked.
    async fn revoke_refresh_session(&self, session_id: Uuid) -> Result<bool, StoreError>;

    /// Bumps the session epoch and revokes every refresh session. Returns the new epoch.
    async fn revoke_all_sessions(&self, account_id: Uuid) -> Result<i64, StoreError>;

    async fn overrides_for(&self, account_id: Uuid) -> Result<Vec<PermissionOverride>, StoreError>;

    /// Replaces the account's whole override set.
    async fn replace_overrides(
        &self,
        account_id: Uuid,
        overrides: &[PermissionOverride],
    ) -> Result<(), StoreError>;

    /// Latest stored matrix version, if any.
    async fn load_permission_matrix(
        &self,
    ) -> Result<Option<(i64, RolePermissionDocument)>, StoreError>;

    /// Appends version `expected_version + 1`; `VersionConflict` if the latest stored
    /// version is not `expected_version`.
    async fn save_permission_matrix(
        &self,
        expected_version: i64,
        document: &RolePermissionDocument,
        updated_by: Option<Uuid>,
    ) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
