//! In-process credential store for tests and `STORE_BACKEND=memory`.
//!
//! One mutex guards all tables, so every trait method is trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    ApprovalTransition, ConsumeOutcome, CredentialStore, NextStateFn, RolePermissionDocument,
    StoreError, TransitionOutcome,
};
use crate::models::{
    Account, ApprovalDecision, ApprovalState, PermissionOverride, RefreshSession, Role,
    VerificationToken,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    tokens: HashMap<String, VerificationToken>,
    decisions: Vec<ApprovalDecision>,
    sessions: HashMap<Uuid, RefreshSession>,
    overrides: HashMap<Uuid, Vec<PermissionOverride>>,
    matrix: Vec<(i64, RolePermissionDocument)>,
}

impl Tables {
    fn login_in_use(&self, login: &str) -> bool {
        self.accounts.values().any(|a| {
            a.approval_state != ApprovalState::Rejected && a.login.eq_ignore_ascii_case(login)
        })
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "in-memory store marked unavailable"
            )));
        }
        self.tables
            .lock()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!("store mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.accounts.contains_key(&account.account_id) {
            return Ok(());
        }
        if account.approval_state != ApprovalState::Rejected && tables.login_in_use(&account.login)
        {
            return Err(StoreError::LoginTaken);
        }
        tables.accounts.insert(account.account_id, account.clone());
        Ok(())
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.tables()?.accounts.get(&account_id).cloned())
    }

    async fn find_account_by_login(&self, login: &str) -> Result<Option<Account>, StoreError> {
        let tables = self.tables()?;
        let mut matches: Vec<&Account> = tables
            .accounts
            .values()
            .filter(|a| a.login.eq_ignore_ascii_case(login))
            .collect();
        matches.sort_by_key(|a| {
            (
                a.approval_state != ApprovalState::Rejected,
                a.created_utc,
            )
        });
        Ok(matches.last().map(|a| (*a).clone()))
    }

    async fn role_exists(&self, role: Role) -> Result<bool, StoreError> {
        Ok(self
            .tables()?
            .accounts
            .values()
            .any(|a| a.role == role && a.approval_state != ApprovalState::Rejected))
    }

    async fn accounts_in_state(&self, state: ApprovalState) -> Result<Vec<Account>, StoreError> {
        let tables = self.tables()?;
        let mut accounts: Vec<Account> = tables
            .accounts
            .values()
            .filter(|a| a.approval_state == state)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_utc);
        Ok(accounts)
    }

    async fn record_login(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound)?;
        account.last_login_utc = Some(at);
        Ok(())
    }

    async fn update_secret(&self, account_id: Uuid, secret_hash: &str) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound)?;
        account.secret_hash = secret_hash.to_string();
        account.updated_utc = Utc::now();
        Ok(())
    }

    async fn issue_verification_token(&self, token: &VerificationToken) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if !tables.accounts.contains_key(&token.account_id) {
            return Err(StoreError::AccountNotFound);
        }
        for existing in tables.tokens.values_mut() {
            if existing.account_id == token.account_id
                && existing.consumed_utc.is_none()
                && existing.superseded_utc.is_none()
            {
                existing.superseded_utc = Some(token.issued_utc);
            }
        }
        tables.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn consume_verification_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        next_state: &NextStateFn,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut tables = self.tables()?;

        let account_id = match tables.tokens.get_mut(token) {
            None => return Ok(ConsumeOutcome::NotFound),
            Some(t) if t.is_expired_at(now) => return Ok(ConsumeOutcome::Expired),
            Some(t) if t.consumed_utc.is_some() => return Ok(ConsumeOutcome::AlreadyUsed),
            Some(t) if t.superseded_utc.is_some() => return Ok(ConsumeOutcome::Superseded),
            Some(t) => {
                t.consumed_utc = Some(now);
                t.account_id
            }
        };

        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound)?;
        account.email_verified = true;
        if account.approval_state == ApprovalState::PendingEmailVerification {
            account.approval_state = next_state(account.role);
        }
        account.updated_utc = now;

        Ok(ConsumeOutcome::Verified {
            account_id,
            approval_state: account.approval_state,
        })
    }

    async fn transition_approval(
        &self,
        transition: &ApprovalTransition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tables = self.tables()?;

        let decision_id = transition.decision.decision_id;
        if tables.decisions.iter().any(|d| d.decision_id == decision_id) {
            return match tables.accounts.get(&transition.account_id) {
                Some(account) => Ok(TransitionOutcome::Applied(account.clone())),
                None => Ok(TransitionOutcome::NotFound),
            };
        }

        let account = match tables.accounts.get_mut(&transition.account_id) {
            None => return Ok(TransitionOutcome::NotFound),
            Some(a) if a.approval_state != transition.from => {
                return Ok(TransitionOutcome::Conflict(a.approval_state))
            }
            Some(a) => a,
        };

        account.approval_state = transition.to;
        account.updated_utc = transition.decision.decided_utc;
        if transition.revoke_sessions {
            account.session_epoch += 1;
        }
        let updated = account.clone();

        if transition.revoke_sessions {
            let now = Utc::now();
            for session in tables.sessions.values_mut() {
                if session.account_id == transition.account_id && session.revoked_utc.is_none() {
                    session.revoked_utc = Some(now);
                }
            }
        }
        tables.decisions.push(transition.decision.clone());

        Ok(TransitionOutcome::Applied(updated))
    }

    async fn decisions_for(&self, account_id: Uuid) -> Result<Vec<ApprovalDecision>, StoreError> {
        Ok(self
            .tables()?
            .decisions
            .iter()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn create_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
        self.tables()?
            .sessions
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_refresh_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<RefreshSession>, StoreError> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    async fn revoke_refresh_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session_id) {
            Some(session) if session.revoked_utc.is_none() => {
                session.revoked_utc = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_sessions(&self, account_id: Uuid) -> Result<i64, StoreError> {
        let mut tables = self.tables()?;
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound)?;
        account.session_epoch += 1;
        let epoch = account.session_epoch;

        let now = Utc::now();
        for session in tables.sessions.values_mut() {
            if session.account_id == account_id && session.revoked_utc.is_none() {
                session.revoked_utc = Some(now);
            }
        }
        Ok(epoch)
    }

    async fn overrides_for(&self, account_id: Uuid) -> Result<Vec<PermissionOverride>, StoreError> {
        Ok(self
            .tables()?
            .overrides
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_overrides(
        &self,
        account_id: Uuid,
        overrides: &[PermissionOverride],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if !tables.accounts.contains_key(&account_id) {
            return Err(StoreError::AccountNotFound);
        }
        tables.overrides.insert(account_id, overrides.to_vec());
        Ok(())
    }

    async fn load_permission_matrix(
        &self,
    ) -> Result<Option<(i64, RolePermissionDocument)>, StoreError> {
        Ok(self.tables()?.matrix.last().cloned())
    }

    async fn save_permission_matrix(
        &self,
        expected_version: i64,
        document: &RolePermissionDocument,
        _updated_by: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let current = tables.matrix.last().map(|(v, _)| *v).unwrap_or(0);
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
            });
        }
        tables.matrix.push((expected_version + 1, document.clone()));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.tables().map(|_| ())
    }
}
