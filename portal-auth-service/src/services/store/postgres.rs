//! PostgreSQL credential store.
//!
//! Every public operation runs through `with_retry`; transient failures (pool timeouts,
//! dropped connections, serialization failures) are retried with backoff and surface as
//! `StoreError::Unavailable` once the budget is spent.
//!
//! A connection can drop after the server committed but before the acknowledgement
//! arrived, so each write recognises its own earlier commit on the retry: the account or
//! token id is already stored, the decision row exists, or the token was consumed at this
//! call's timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::utils::{with_retry, RetryConfig};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{
    ApprovalTransition, ConsumeOutcome, CredentialStore, NextStateFn, RolePermissionDocument,
    StoreError, TransitionOutcome,
};
use crate::models::{
    Account, ApprovalDecision, ApprovalState, Decision, OverrideEffect, PermissionOverride,
    RefreshSession, Role, VerificationToken,
};

const ACCOUNT_COLUMNS: &str = "account_id, login, email, secret_hash, role_code, profile, \
     email_verified, approval_state, session_epoch, created_utc, updated_utc, last_login_utc";

#[derive(Debug, FromRow)]
struct AccountRow {
    account_id: Uuid,
    login: String,
    email: String,
    secret_hash: String,
    role_code: String,
    profile: serde_json::Value,
    email_verified: bool,
    approval_state: String,
    session_epoch: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    last_login_utc: Option<DateTime<Utc>>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            account_id: row.account_id,
            login: row.login,
            email: row.email,
            secret_hash: row.secret_hash,
            role: row.role_code.parse::<Role>().map_err(corrupt)?,
            profile: row.profile,
            email_verified: row.email_verified,
            approval_state: row.approval_state.parse::<ApprovalState>().map_err(corrupt)?,
            session_epoch: row.session_epoch,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            last_login_utc: row.last_login_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct DecisionRow {
    decision_id: Uuid,
    account_id: Uuid,
    decision_code: String,
    reviewer_id: Uuid,
    notes: Option<String>,
    decided_utc: DateTime<Utc>,
}

impl TryFrom<DecisionRow> for ApprovalDecision {
    type Error = StoreError;

    fn try_from(row: DecisionRow) -> Result<Self, Self::Error> {
        Ok(ApprovalDecision {
            decision_id: row.decision_id,
            account_id: row.account_id,
            decision: row.decision_code.parse::<Decision>().map_err(corrupt)?,
            reviewer_id: row.reviewer_id,
            notes: row.notes,
            decided_utc: row.decided_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct TokenStateRow {
    account_id: Uuid,
    consumed_utc: Option<DateTime<Utc>>,
    superseded_utc: Option<DateTime<Utc>>,
    expiry_utc: DateTime<Utc>,
    consumed_at_now: bool,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: Uuid,
    account_id: Uuid,
    token_hash_text: String,
    expiry_utc: DateTime<Utc>,
    revoked_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl From<SessionRow> for RefreshSession {
    fn from(row: SessionRow) -> Self {
        RefreshSession {
            session_id: row.session_id,
            account_id: row.account_id,
            token_hash_text: row.token_hash_text,
            expiry_utc: row.expiry_utc,
            revoked_utc: row.revoked_utc,
            created_utc: row.created_utc,
        }
    }
}

fn corrupt(message: String) -> StoreError {
    StoreError::Internal(anyhow::anyhow!("Corrupt row: {}", message))
}

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    let transient = match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected, admin_shutdown
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P01")
        ),
        _ => false,
    };

    if transient {
        StoreError::Unavailable(e.into())
    } else {
        StoreError::Internal(e.into())
    }
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    async fn retrying<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.retry, operation, f).await
    }

    async fn insert_account_once(&self, account: &Account) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (account_id, login, email, secret_hash, role_code, profile,
                                  email_verified, approval_state, session_epoch,
                                  created_utc, updated_utc, last_login_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(account.account_id)
        .bind(&account.login)
        .bind(&account.email)
        .bind(&account.secret_hash)
        .bind(account.role.as_str())
        .bind(&account.profile)
        .bind(account.email_verified)
        .bind(account.approval_state.as_str())
        .bind(account.session_epoch)
        .bind(account.created_utc)
        .bind(account.updated_utc)
        .bind(account.last_login_utc)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let (stored,): (bool,) = sqlx::query_as(
                    "SELECT EXISTS (SELECT 1 FROM accounts WHERE account_id = $1)",
                )
                .bind(account.account_id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
                if stored {
                    Ok(())
                } else {
                    Err(StoreError::LoginTaken)
                }
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn consume_once(
        &self,
        token: &str,
        now: DateTime<Utc>,
        next_state: &NextStateFn,
        replay: bool,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let consumed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE verification_tokens
               SET consumed_utc = $2
             WHERE token = $1
               AND consumed_utc IS NULL
               AND superseded_utc IS NULL
               AND expiry_utc > $2
            RETURNING account_id
            "#,
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some((account_id,)) = consumed else {
            let existing: Option<TokenStateRow> = sqlx::query_as(
                r#"
                SELECT account_id, consumed_utc, superseded_utc, expiry_utc,
                       COALESCE(consumed_utc = $2, FALSE) AS consumed_at_now
                  FROM verification_tokens
                 WHERE token = $1
                "#,
            )
            .bind(token)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            let Some(existing) = existing else {
                return Ok(ConsumeOutcome::NotFound);
            };
            if replay && existing.consumed_at_now {
                let (state_code,): (String,) =
                    sqlx::query_as("SELECT approval_state FROM accounts WHERE account_id = $1")
                        .bind(existing.account_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                return Ok(ConsumeOutcome::Verified {
                    account_id: existing.account_id,
                    approval_state: state_code.parse::<ApprovalState>().map_err(corrupt)?,
                });
            }

            return Ok(if existing.expiry_utc <= now {
                ConsumeOutcome::Expired
            } else if existing.consumed_utc.is_some() {
                ConsumeOutcome::AlreadyUsed
            } else if existing.superseded_utc.is_some() {
                ConsumeOutcome::Superseded
            } else {
                // A concurrent consume holds the row and won
                ConsumeOutcome::AlreadyUsed
            });
        };

        let (role_code, state_code): (String, String) = sqlx::query_as(
            "SELECT role_code, approval_state FROM accounts WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let role = role_code.parse::<Role>().map_err(corrupt)?;
        let current = state_code.parse::<ApprovalState>().map_err(corrupt)?;
        let next = if current == ApprovalState::PendingEmailVerification {
            next_state(role)
        } else {
            current
        };

        sqlx::query(
            r#"
            UPDATE accounts
               SET email_verified = TRUE, approval_state = $2, updated_utc = $3
             WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(next.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(ConsumeOutcome::Verified {
            account_id,
            approval_state: next,
        })
    }

    async fn transition_once(
        &self,
        transition: &ApprovalTransition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let updated: Option<AccountRow> = sqlx::query_as(&format!(
            r#"
            UPDATE accounts
               SET approval_state = $3,
                   updated_utc = $4,
                   session_epoch = session_epoch + CASE WHEN $5 THEN 1 ELSE 0 END
             WHERE account_id = $1 AND approval_state = $2
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(transition.account_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.decision.decided_utc)
        .bind(transition.revoke_sessions)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = updated else {
            let (recorded,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM approval_decisions WHERE decision_id = $1)",
            )
            .bind(transition.decision.decision_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            let current: Option<AccountRow> = sqlx::query_as(&format!(
                "SELECT {} FROM accounts WHERE account_id = $1",
                ACCOUNT_COLUMNS
            ))
            .bind(transition.account_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            return match current {
                None => Ok(TransitionOutcome::NotFound),
                Some(row) if recorded => Ok(TransitionOutcome::Applied(Account::try_from(row)?)),
                Some(row) => Ok(TransitionOutcome::Conflict(
                    row.approval_state.parse::<ApprovalState>().map_err(corrupt)?,
                )),
            };
        };

        let decision = &transition.decision;
        sqlx::query(
            r#"
            INSERT INTO approval_decisions (decision_id, account_id, decision_code, reviewer_id, notes, decided_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(decision.decision_id)
        .bind(decision.account_id)
        .bind(decision.decision.as_str())
        .bind(decision.reviewer_id)
        .bind(&decision.notes)
        .bind(decision.decided_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if transition.revoke_sessions {
            sqlx::query(
                "UPDATE refresh_sessions SET revoked_utc = now() WHERE account_id = $1 AND revoked_utc IS NULL",
            )
            .bind(transition.account_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(TransitionOutcome::Applied(Account::try_from(row)?))
    }

    async fn issue_token_once(&self, token: &VerificationToken) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Serializes concurrent issues for the same account
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT account_id FROM accounts WHERE account_id = $1 FOR UPDATE")
                .bind(token.account_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(StoreError::AccountNotFound);
        }

        let (stored,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM verification_tokens WHERE token = $1)")
                .bind(&token.token)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        if stored {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE verification_tokens
               SET superseded_utc = $2
             WHERE account_id = $1 AND consumed_utc IS NULL AND superseded_utc IS NULL
            "#,
        )
        .bind(token.account_id)
        .bind(token.issued_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO verification_tokens (token, account_id, issued_utc, expiry_utc, consumed_utc, superseded_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&token.token)
        .bind(token.account_id)
        .bind(token.issued_utc)
        .bind(token.expiry_utc)
        .bind(token.consumed_utc)
        .bind(token.superseded_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn revoke_all_once(&self, account_id: Uuid) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let epoch: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE accounts
               SET session_epoch = session_epoch + 1, updated_utc = now()
             WHERE account_id = $1
            RETURNING session_epoch
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let (epoch,) = epoch.ok_or(StoreError::AccountNotFound)?;

        sqlx::query(
            "UPDATE refresh_sessions SET revoked_utc = now() WHERE account_id = $1 AND revoked_utc IS NULL",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(epoch)
    }

    async fn replace_overrides_once(
        &self,
        account_id: Uuid,
        overrides: &[PermissionOverride],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT account_id FROM accounts WHERE account_id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(StoreError::AccountNotFound);
        }

        sqlx::query("DELETE FROM permission_overrides WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        for o in overrides {
            sqlx::query(
                "INSERT INTO permission_overrides (account_id, permission, effect_code) VALUES ($1, $2, $3)",
            )
            .bind(account_id)
            .bind(o.permission.as_str())
            .bind(o.effect.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn save_matrix_once(
        &self,
        expected_version: i64,
        document: &RolePermissionDocument,
        updated_by: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO permission_matrix (version, document, updated_by)
            SELECT $1, $2, $3
             WHERE (SELECT COALESCE(MAX(version), 0) FROM permission_matrix) = $4
            "#,
        )
        .bind(expected_version + 1)
        .bind(Json(document))
        .bind(updated_by)
        .bind(expected_version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => return Ok(()),
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {}
            Err(e) => return Err(map_sqlx_error(e)),
        }

        let (stored,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM permission_matrix WHERE version = $1 AND document = $2)",
        )
        .bind(expected_version + 1)
        .bind(Json(document))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        if stored {
            Ok(())
        } else {
            Err(StoreError::VersionConflict {
                expected: expected_version,
            })
        }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.retrying("insert_account", || self.insert_account_once(account))
            .await
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        let query = format!("SELECT {} FROM accounts WHERE account_id = $1", ACCOUNT_COLUMNS);
        let query = query.as_str();
        let row: Option<AccountRow> = self
            .retrying("find_account", || async move {
                sqlx::query_as(&query)
                    .bind(account_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_login(&self, login: &str) -> Result<Option<Account>, StoreError> {
        let query = format!(
            r#"
            SELECT {} FROM accounts
             WHERE lower(login) = lower($1)
             ORDER BY (approval_state <> 'rejected') DESC, created_utc DESC
             LIMIT 1
            "#,
            ACCOUNT_COLUMNS
        );
        let query = query.as_str();
        let row: Option<AccountRow> = self
            .retrying("find_account_by_login", || async move {
                sqlx::query_as(&query)
                    .bind(login)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        row.map(Account::try_from).transpose()
    }

    async fn role_exists(&self, role: Role) -> Result<bool, StoreError> {
        let (exists,): (bool,) = self
            .retrying("role_exists", || async move {
                sqlx::query_as(
                    "SELECT EXISTS (SELECT 1 FROM accounts WHERE role_code = $1 AND approval_state <> 'rejected')",
                )
                .bind(role.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        Ok(exists)
    }

    async fn accounts_in_state(&self, state: ApprovalState) -> Result<Vec<Account>, StoreError> {
        let query = format!(
            "SELECT {} FROM accounts WHERE approval_state = $1 ORDER BY created_utc",
            ACCOUNT_COLUMNS
        );
        let query = query.as_str();
        let rows: Vec<AccountRow> = self
            .retrying("accounts_in_state", || async move {
                sqlx::query_as(&query)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        rows.into_iter().map(Account::try_from).collect()
    }

    async fn record_login(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let done = self
            .retrying("record_login", || async move {
                sqlx::query("UPDATE accounts SET last_login_utc = $2 WHERE account_id = $1")
                    .bind(account_id)
                    .bind(at)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx_error)
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound);
        }
        Ok(())
    }

    async fn update_secret(&self, account_id: Uuid, secret_hash: &str) -> Result<(), StoreError> {
        let done = self
            .retrying("update_secret", || async move {
                sqlx::query(
                    "UPDATE accounts SET secret_hash = $2, updated_utc = now() WHERE account_id = $1",
                )
                .bind(account_id)
                .bind(secret_hash)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound);
        }
        Ok(())
    }

    async fn issue_verification_token(&self, token: &VerificationToken) -> Result<(), StoreError> {
        self.retrying("issue_verification_token", || self.issue_token_once(token))
            .await
    }

    async fn consume_verification_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        next_state: &NextStateFn,
    ) -> Result<ConsumeOutcome, StoreError> {
        let attempted = AtomicBool::new(false);
        self.retrying("consume_verification_token", || {
            let replay = attempted.swap(true, Ordering::SeqCst);
            self.consume_once(token, now, next_state, replay)
        })
        .await
    }

    async fn transition_approval(
        &self,
        transition: &ApprovalTransition,
    ) -> Result<TransitionOutcome, StoreError> {
        self.retrying("transition_approval", || self.transition_once(transition))
            .await
    }

    async fn decisions_for(&self, account_id: Uuid) -> Result<Vec<ApprovalDecision>, StoreError> {
        let rows: Vec<DecisionRow> = self
            .retrying("decisions_for", || async move {
                sqlx::query_as(
                    r#"
                    SELECT decision_id, account_id, decision_code, reviewer_id, notes, decided_utc
                      FROM approval_decisions
                     WHERE account_id = $1
                     ORDER BY decided_utc
                    "#,
                )
                .bind(account_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        rows.into_iter().map(ApprovalDecision::try_from).collect()
    }

    async fn create_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
        self.retrying("create_refresh_session", || async move {
            sqlx::query(
                r#"
                INSERT INTO refresh_sessions (session_id, account_id, token_hash_text, expiry_utc, revoked_utc, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(session.session_id)
            .bind(session.account_id)
            .bind(&session.token_hash_text)
            .bind(session.expiry_utc)
            .bind(session.revoked_utc)
            .bind(session.created_utc)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
        })
        .await
    }

    async fn find_refresh_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<RefreshSession>, StoreError> {
        let row: Option<SessionRow> = self
            .retrying("find_refresh_session", || async move {
                sqlx::query_as(
                    r#"
                    SELECT session_id, account_id, token_hash_text, expiry_utc, revoked_utc, created_utc
                      FROM refresh_sessions
                     WHERE session_id = $1
                    "#,
                )
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        Ok(row.map(RefreshSession::from))
    }

    async fn revoke_refresh_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let done = self
            .retrying("revoke_refresh_session", || async move {
                sqlx::query(
                    "UPDATE refresh_sessions SET revoked_utc = now() WHERE session_id = $1 AND revoked_utc IS NULL",
                )
                .bind(session_id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn revoke_all_sessions(&self, account_id: Uuid) -> Result<i64, StoreError> {
        self.retrying("revoke_all_sessions", || self.revoke_all_once(account_id))
            .await
    }

    async fn overrides_for(&self, account_id: Uuid) -> Result<Vec<PermissionOverride>, StoreError> {
        let rows: Vec<(String, String)> = self
            .retrying("overrides_for", || async move {
                sqlx::query_as(
                    "SELECT permission, effect_code FROM permission_overrides WHERE account_id = $1 ORDER BY permission",
                )
                .bind(account_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;

        rows.into_iter()
            .map(|(permission, effect)| {
                Ok(PermissionOverride {
                    account_id,
                    permission: permission
                        .parse()
                        .map_err(|id| corrupt(format!("unknown permission {}", id)))?,
                    effect: effect.parse::<OverrideEffect>().map_err(corrupt)?,
                })
            })
            .collect()
    }

    async fn replace_overrides(
        &self,
        account_id: Uuid,
        overrides: &[PermissionOverride],
    ) -> Result<(), StoreError> {
        self.retrying("replace_overrides", || {
            self.replace_overrides_once(account_id, overrides)
        })
        .await
    }

    async fn load_permission_matrix(
        &self,
    ) -> Result<Option<(i64, RolePermissionDocument)>, StoreError> {
        let row: Option<(i64, Json<RolePermissionDocument>)> = self
            .retrying("load_permission_matrix", || async move {
                sqlx::query_as(
                    "SELECT version, document FROM permission_matrix ORDER BY version DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)
            })
            .await?;
        Ok(row.map(|(version, Json(document))| (version, document)))
    }

    async fn save_permission_matrix(
        &self,
        expected_version: i64,
        document: &RolePermissionDocument,
        updated_by: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.retrying("save_permission_matrix", || {
            self.save_matrix_once(expected_version, document, updated_by)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}
