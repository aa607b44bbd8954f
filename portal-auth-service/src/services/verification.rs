//! Verification coordinator: issues, resends and consumes single-use email tokens.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{ApprovalState, Role, VerificationToken};
use crate::services::email::EmailProvider;
use crate::services::error::ServiceError;
use crate::services::metrics;
use crate::services::policy::ReviewPolicy;
use crate::services::store::{ConsumeOutcome, CredentialStore};

/// Result of a successful consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub account_id: Uuid,
    pub approval_state: ApprovalState,
}

pub struct VerificationCoordinator {
    store: Arc<dyn CredentialStore>,
    email: Arc<dyn EmailProvider>,
    policy: Arc<ReviewPolicy>,
    token_ttl: Duration,
    base_url: String,
}

impl VerificationCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        email: Arc<dyn EmailProvider>,
        policy: Arc<ReviewPolicy>,
        token_ttl: Duration,
        base_url: String,
    ) -> Self {
        Self {
            store,
            email,
            policy,
            token_ttl,
            base_url,
        }
    }

    /// Issue a fresh token, superseding every earlier unconsumed one, then send the
    /// verification email. A delivery failure is logged and does not fail the call.
    pub async fn issue_token(&self, account_id: Uuid) -> Result<VerificationToken, ServiceError> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        if account.email_verified {
            return Err(ServiceError::InvalidStateTransition {
                from: account.approval_state,
                action: "send a verification token to",
            });
        }

        let token = VerificationToken::new(account_id, self.token_ttl);
        self.store.issue_verification_token(&token).await?;

        tracing::info!(
            account_id = %account_id,
            expiry_utc = %token.expiry_utc,
            "Verification token issued"
        );
        metrics::record_provisioning("verification", "issued");

        if let Err(e) = self
            .email
            .send_verification_email(&account.email, &token.token, &self.base_url)
            .await
        {
            tracing::error!(
                account_id = %account_id,
                error = %e,
                "Failed to send verification email"
            );
            metrics::record_provisioning("verification", "notification_failed");
        }

        Ok(token)
    }

    /// Same as [`issue_token`](Self::issue_token). Rate limiting is the caller's concern.
    pub async fn resend(&self, account_id: Uuid) -> Result<VerificationToken, ServiceError> {
        self.issue_token(account_id).await
    }

    /// Consume `token`. On success the account is verified and, if it was waiting on
    /// verification, moved to the state the review policy assigns its role.
    pub async fn consume_token(&self, token: &str) -> Result<Verified, ServiceError> {
        let policy = self.policy.clone();
        let next_state = move |role: Role| policy.state_after_verification(role);

        let outcome = self
            .store
            .consume_verification_token(token, Utc::now(), &next_state)
            .await?;

        let (label, result) = match outcome {
            ConsumeOutcome::Verified {
                account_id,
                approval_state,
            } => {
                tracing::info!(
                    account_id = %account_id,
                    approval_state = %approval_state,
                    "Email verified"
                );
                (
                    "verified",
                    Ok(Verified {
                        account_id,
                        approval_state,
                    }),
                )
            }
            ConsumeOutcome::NotFound => ("not_found", Err(ServiceError::TokenNotFound)),
            ConsumeOutcome::Expired => ("expired", Err(ServiceError::TokenExpired)),
            ConsumeOutcome::AlreadyUsed => ("already_used", Err(ServiceError::TokenAlreadyUsed)),
            ConsumeOutcome::Superseded => ("superseded", Err(ServiceError::TokenSuperseded)),
        };
        metrics::record_provisioning("verification", label);

        if let Err(e) = &result {
            tracing::info!(code = e.code(), "Verification token refused");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;
    use crate::services::email::MockEmailService;
    use crate::services::store::InMemoryCredentialStore;

    struct Harness {
        store: Arc<InMemoryCredentialStore>,
        email: Arc<MockEmailService>,
        coordinator: Arc<VerificationCoordinator>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryCredentialStore::new());
        let email = Arc::new(MockEmailService::new());
        let coordinator = Arc::new(VerificationCoordinator::new(
            store.clone(),
            email.clone(),
            Arc::new(ReviewPolicy::default()),
            Duration::hours(24),
            "http://portal.test".to_string(),
        ));
        Harness {
            store,
            email,
            coordinator,
        }
    }

    async fn registered(store: &InMemoryCredentialStore, role: Role) -> Account {
        let account = Account::new(
            format!("login-{}", Uuid::new_v4()),
            format!("{}@example.org", Uuid::new_v4()),
            "$argon2id$stub".into(),
            role,
            serde_json::json!({}),
        );
        store.insert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_consume_moves_staff_to_admin_review_and_patients_to_approved() {
        let h = harness();
        let doctor = registered(&h.store, Role::Doctor).await;
        let patient = registered(&h.store, Role::Patient).await;

        let doctor_token = h.coordinator.issue_token(doctor.account_id).await.unwrap();
        let patient_token = h.coordinator.issue_token(patient.account_id).await.unwrap();

        let verified = h.coordinator.consume_token(&doctor_token.token).await.unwrap();
        assert_eq!(verified.approval_state, ApprovalState::PendingAdminApproval);

        let verified = h.coordinator.consume_token(&patient_token.token).await.unwrap();
        assert_eq!(verified.approval_state, ApprovalState::Approved);

        let stored = h.store.find_account(patient.account_id).await.unwrap().unwrap();
        assert!(stored.email_verified);
    }

    #[tokio::test]
    async fn test_second_consume_reports_already_used() {
        let h = harness();
        let account = registered(&h.store, Role::Nurse).await;
        let token = h.coordinator.issue_token(account.account_id).await.unwrap();

        h.coordinator.consume_token(&token.token).await.unwrap();
        let err = h.coordinator.consume_token(&token.token).await.unwrap_err();
        assert!(matches!(err, ServiceError::TokenAlreadyUsed));
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let h = harness();
        let err = h.coordinator.consume_token("deadbeef").await.unwrap_err();
        assert!(matches!(err, ServiceError::TokenNotFound));
    }

    #[tokio::test]
    async fn test_only_the_latest_resend_verifies() {
        let h = harness();
        let account = registered(&h.store, Role::Staff).await;

        let first = h.coordinator.issue_token(account.account_id).await.unwrap();
        let second = h.coordinator.resend(account.account_id).await.unwrap();
        let third = h.coordinator.resend(account.account_id).await.unwrap();

        for stale in [&first, &second] {
            let err = h.coordinator.consume_token(&stale.token).await.unwrap_err();
            assert!(matches!(err, ServiceError::TokenSuperseded));
        }
        assert!(h.coordinator.consume_token(&third.token).await.is_ok());
        assert_eq!(
            h.email.last_verification_token(&account.email).as_deref(),
            Some(third.token.as_str())
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_refused_and_account_stays_unverified() {
        let h = harness();
        let account = registered(&h.store, Role::Patient).await;

        let stale = VerificationToken::new(account.account_id, Duration::hours(-1));
        h.store.issue_verification_token(&stale).await.unwrap();

        let err = h.coordinator.consume_token(&stale.token).await.unwrap_err();
        assert!(matches!(err, ServiceError::TokenExpired));

        let stored = h.store.find_account(account.account_id).await.unwrap().unwrap();
        assert!(!stored.email_verified);
        assert_eq!(stored.approval_state, ApprovalState::PendingEmailVerification);
    }

    #[tokio::test]
    async fn test_email_failure_does_not_fail_issuance() {
        let h = harness();
        let account = registered(&h.store, Role::Doctor).await;
        h.email.set_failing(true);

        let token = h.coordinator.issue_token(account.account_id).await.unwrap();
        assert!(h.coordinator.consume_token(&token.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_verified_accounts_get_no_new_tokens() {
        let h = harness();
        let account = registered(&h.store, Role::Doctor).await;
        let token = h.coordinator.issue_token(account.account_id).await.unwrap();
        h.coordinator.consume_token(&token.token).await.unwrap();

        let err = h.coordinator.resend(account.account_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStateTransition { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_have_exactly_one_winner() {
        let h = harness();
        let account = registered(&h.store, Role::Pharmacist).await;
        let token = h.coordinator.issue_token(account.account_id).await.unwrap();

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                let token = token.token.clone();
                tokio::spawn(async move { coordinator.consume_token(&token).await })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, ServiceError::TokenAlreadyUsed)),
            }
        }
        assert_eq!(winners, 1);
    }
}
