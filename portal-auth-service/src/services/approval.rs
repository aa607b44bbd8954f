//! Approval coordinator: the only writer of `approval_state` outside the verification
//! consume. Every decision is a state-guarded transition plus an append-only record.

use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Account, ApprovalDecision, ApprovalState, Decision};
use crate::services::email::EmailProvider;
use crate::services::error::ServiceError;
use crate::services::metrics;
use crate::services::store::{ApprovalTransition, CredentialStore, TransitionOutcome};

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub account: Account,
    pub decision: ApprovalDecision,
}

/// Error for a transition attempted from `current`: terminal states are already decided,
/// anything else is simply not a legal starting point.
fn classify(current: ApprovalState, action: &'static str) -> ServiceError {
    if current.is_terminal() {
        ServiceError::AlreadyDecided { state: current }
    } else {
        ServiceError::InvalidStateTransition {
            from: current,
            action,
        }
    }
}

pub struct ApprovalCoordinator {
    store: Arc<dyn CredentialStore>,
    email: Arc<dyn EmailProvider>,
}

impl ApprovalCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, email: Arc<dyn EmailProvider>) -> Self {
        Self { store, email }
    }

    pub async fn approve(
        &self,
        account_id: Uuid,
        reviewer_id: Uuid,
        notes: Option<String>,
    ) -> Result<DecisionOutcome, ServiceError> {
        self.decide(
            account_id,
            reviewer_id,
            notes,
            ApprovalState::PendingAdminApproval,
            Decision::Approved,
            "approve",
        )
        .await
    }

    pub async fn reject(
        &self,
        account_id: Uuid,
        reviewer_id: Uuid,
        notes: Option<String>,
    ) -> Result<DecisionOutcome, ServiceError> {
        self.decide(
            account_id,
            reviewer_id,
            notes,
            ApprovalState::PendingAdminApproval,
            Decision::Rejected,
            "reject",
        )
        .await
    }

    /// `approved -> rejected`, revoking every session in the same store operation.
    pub async fn revoke_approval(
        &self,
        account_id: Uuid,
        reviewer_id: Uuid,
        notes: Option<String>,
    ) -> Result<DecisionOutcome, ServiceError> {
        self.decide(
            account_id,
            reviewer_id,
            notes,
            ApprovalState::Approved,
            Decision::Rejected,
            "revoke approval of",
        )
        .await
    }

    pub async fn decisions(&self, account_id: Uuid) -> Result<Vec<ApprovalDecision>, ServiceError> {
        if self.store.find_account(account_id).await?.is_none() {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(self.store.decisions_for(account_id).await?)
    }

    /// Accounts waiting on an administrator.
    pub async fn pending_reviews(&self) -> Result<Vec<Account>, ServiceError> {
        Ok(self
            .store
            .accounts_in_state(ApprovalState::PendingAdminApproval)
            .await?)
    }

    async fn decide(
        &self,
        account_id: Uuid,
        reviewer_id: Uuid,
        notes: Option<String>,
        from: ApprovalState,
        decision: Decision,
        action: &'static str,
    ) -> Result<DecisionOutcome, ServiceError> {
        let to = match decision {
            Decision::Approved => ApprovalState::Approved,
            Decision::Rejected => ApprovalState::Rejected,
        };
        let transition = ApprovalTransition {
            account_id,
            from,
            to,
            decision: ApprovalDecision::new(account_id, decision, reviewer_id, notes),
            revoke_sessions: from == ApprovalState::Approved,
        };

        let account = match self.store.transition_approval(&transition).await? {
            TransitionOutcome::Applied(account) => account,
            TransitionOutcome::NotFound => return Err(ServiceError::AccountNotFound),
            TransitionOutcome::Conflict(current) => {
                tracing::info!(
                    account_id = %account_id,
                    reviewer_id = %reviewer_id,
                    approval_state = %current,
                    action,
                    "Approval transition refused"
                );
                metrics::record_provisioning("approval", "conflict");
                return Err(classify(current, action));
            }
        };

        tracing::info!(
            account_id = %account_id,
            reviewer_id = %reviewer_id,
            from = %from,
            to = %to,
            "Approval decision recorded"
        );
        metrics::record_provisioning("approval", decision.as_str());

        if let Err(e) = self
            .email
            .send_decision_email(
                &account.email,
                &account.login,
                decision,
                transition.decision.notes.as_deref(),
            )
            .await
        {
            tracing::error!(
                account_id = %account_id,
                error = %e,
                "Failed to send decision email"
            );
        }

        Ok(DecisionOutcome {
            account,
            decision: transition.decision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::email::{MockEmailService, SentEmail};
    use crate::services::store::InMemoryCredentialStore;

    struct Harness {
        store: Arc<InMemoryCredentialStore>,
        email: Arc<MockEmailService>,
        coordinator: Arc<ApprovalCoordinator>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryCredentialStore::new());
        let email = Arc::new(MockEmailService::new());
        let coordinator = Arc::new(ApprovalCoordinator::new(store.clone(), email.clone()));
        Harness {
            store,
            email,
            coordinator,
        }
    }

    async fn account_in(store: &InMemoryCredentialStore, state: ApprovalState) -> Account {
        let mut account = Account::new(
            format!("login-{}", Uuid::new_v4()),
            "reviewed@example.org".into(),
            "$argon2id$stub".into(),
            Role::Doctor,
            serde_json::json!({}),
        );
        account.email_verified = state != ApprovalState::PendingEmailVerification;
        account.approval_state = state;
        store.insert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_approve_records_decision_and_notifies() {
        let h = harness();
        let account = account_in(&h.store, ApprovalState::PendingAdminApproval).await;
        let reviewer = Uuid::new_v4();

        let outcome = h
            .coordinator
            .approve(account.account_id, reviewer, Some("license ok".into()))
            .await
            .unwrap();

        assert_eq!(outcome.account.approval_state, ApprovalState::Approved);
        assert_eq!(outcome.decision.reviewer_id, reviewer);

        let history = h.coordinator.decisions(account.account_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, Decision::Approved);
        assert_eq!(
            h.email.sent(),
            vec![SentEmail::Decision {
                to: "reviewed@example.org".into(),
                decision: Decision::Approved
            }]
        );
    }

    #[tokio::test]
    async fn test_decisions_before_verification_are_invalid() {
        let h = harness();
        let account = account_in(&h.store, ApprovalState::PendingEmailVerification).await;

        for result in [
            h.coordinator.approve(account.account_id, Uuid::new_v4(), None).await,
            h.coordinator.reject(account.account_id, Uuid::new_v4(), None).await,
        ] {
            assert!(matches!(
                result.unwrap_err(),
                ServiceError::InvalidStateTransition {
                    from: ApprovalState::PendingEmailVerification,
                    ..
                }
            ));
        }
        assert!(h.coordinator.decisions(account.account_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decided_accounts_report_already_decided() {
        let h = harness();
        let account = account_in(&h.store, ApprovalState::PendingAdminApproval).await;
        h.coordinator
            .reject(account.account_id, Uuid::new_v4(), None)
            .await
            .unwrap();

        let err = h
            .coordinator
            .approve(account.account_id, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::AlreadyDecided {
                state: ApprovalState::Rejected
            }
        ));
    }

    #[tokio::test]
    async fn test_revoke_approval_only_from_approved() {
        let h = harness();
        let pending = account_in(&h.store, ApprovalState::PendingAdminApproval).await;
        let err = h
            .coordinator
            .revoke_approval(pending.account_id, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStateTransition { .. }));

        let approved = account_in(&h.store, ApprovalState::Approved).await;
        let outcome = h
            .coordinator
            .revoke_approval(approved.account_id, Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(outcome.account.approval_state, ApprovalState::Rejected);
        assert_eq!(outcome.account.session_epoch, approved.session_epoch + 1);

        let again = h
            .coordinator
            .revoke_approval(approved.account_id, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(again, ServiceError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let h = harness();
        let err = h
            .coordinator
            .approve(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccountNotFound));
    }

    #[tokio::test]
    async fn test_pending_reviews_lists_only_waiting_accounts() {
        let h = harness();
        let waiting = account_in(&h.store, ApprovalState::PendingAdminApproval).await;
        account_in(&h.store, ApprovalState::Approved).await;
        account_in(&h.store, ApprovalState::PendingEmailVerification).await;

        let pending = h.coordinator.pending_reviews().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].account_id, waiting.account_id);
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_the_decision() {
        let h = harness();
        h.email.set_failing(true);
        let account = account_in(&h.store, ApprovalState::PendingAdminApproval).await;

        h.coordinator
            .approve(account.account_id, Uuid::new_v4(), None)
            .await
            .unwrap();
        let stored = h.store.find_account(account.account_id).await.unwrap().unwrap();
        assert_eq!(stored.approval_state, ApprovalState::Approved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_approve_and_reject_have_one_winner() {
        let h = harness();
        let account = account_in(&h.store, ApprovalState::PendingAdminApproval).await;

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let coordinator = h.coordinator.clone();
                let id = account.account_id;
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        coordinator.approve(id, Uuid::new_v4(), None).await
                    } else {
                        coordinator.reject(id, Uuid::new_v4(), None).await
                    }
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, ServiceError::AlreadyDecided { .. })),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(h.coordinator.decisions(account.account_id).await.unwrap().len(), 1);
    }
}
