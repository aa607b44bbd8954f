//! Account lifecycle entry points: registration, login gate, verification resend,
//! password change and first-admin bootstrap.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::dtos::admin::{BootstrapAdminRequest, BootstrapAdminResponse};
use crate::dtos::auth::{LoginRequest, RegisterRequest, RegisterResponse};
use crate::models::{Account, ApprovalState, Role};
use crate::services::cache::SessionCache;
use crate::services::error::ServiceError;
use crate::services::jwt::TokenResponse;
use crate::services::metrics;
use crate::services::policy::ReviewPolicy;
use crate::services::session::SessionIssuer;
use crate::services::store::CredentialStore;
use crate::services::verification::VerificationCoordinator;
use crate::utils::password::verify_against_dummy;
use crate::utils::{hash_password, verify_password, Password};

pub struct AccountService {
    store: Arc<dyn CredentialStore>,
    policy: Arc<ReviewPolicy>,
    verification: Arc<VerificationCoordinator>,
    sessions: Arc<SessionIssuer>,
    cache: Arc<dyn SessionCache>,
    resend_cooldown_seconds: u64,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: Arc<ReviewPolicy>,
        verification: Arc<VerificationCoordinator>,
        sessions: Arc<SessionIssuer>,
        cache: Arc<dyn SessionCache>,
        resend_cooldown_seconds: u64,
    ) -> Self {
        Self {
            store,
            policy,
            verification,
            sessions,
            cache,
            resend_cooldown_seconds,
        }
    }

    /// Create the account in `pending_email_verification` and send the first token.
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, ServiceError> {
        let login = req.login.trim();
        if login.chars().any(char::is_whitespace) {
            return Err(ServiceError::validation("login", "must not contain whitespace"));
        }

        let problems = self.policy.check_registration(req.role, &req.profile);
        if !problems.is_empty() {
            metrics::record_provisioning("registration", "invalid");
            return Err(ServiceError::Validation(problems));
        }

        let secret_hash = hash_password(&Password::new(req.password))?;
        let account = Account::new(
            login.to_string(),
            req.email.trim().to_lowercase(),
            secret_hash,
            req.role,
            req.profile,
        );

        if let Err(e) = self.store.insert_account(&account).await {
            let err = ServiceError::from(e);
            if matches!(err, ServiceError::LoginTaken) {
                metrics::record_provisioning("registration", "login_taken");
            }
            return Err(err);
        }

        tracing::info!(
            account_id = %account.account_id,
            role = %account.role,
            "Account registered"
        );
        metrics::record_provisioning("registration", "created");

        // The account exists either way; the holder can ask for a resend.
        if let Err(e) = self.verification.issue_token(account.account_id).await {
            tracing::error!(
                account_id = %account.account_id,
                error = %e,
                "Failed to issue initial verification token"
            );
        }

        Ok(RegisterResponse {
            account_id: account.account_id,
            approval_state: account.approval_state,
        })
    }

    /// Credentials, then email verification, then approval. Only a fully provisioned
    /// account gets tokens.
    pub async fn login(&self, req: LoginRequest) -> Result<TokenResponse, ServiceError> {
        let password = Password::new(req.password);

        let Some(account) = self.store.find_account_by_login(req.login.trim()).await? else {
            verify_against_dummy(&password);
            metrics::record_provisioning("login", "invalid_credentials");
            return Err(ServiceError::InvalidCredentials);
        };

        let matches = verify_password(&password, &account.secret_hash).unwrap_or_else(|e| {
            tracing::error!(account_id = %account.account_id, error = %e, "Stored secret hash is unreadable");
            false
        });
        if !matches {
            tracing::info!(account_id = %account.account_id, "Login refused: bad credentials");
            metrics::record_provisioning("login", "invalid_credentials");
            return Err(ServiceError::InvalidCredentials);
        }

        if !account.email_verified {
            metrics::record_provisioning("login", "email_not_verified");
            return Err(ServiceError::EmailNotVerified {
                account_id: account.account_id,
            });
        }

        match account.approval_state {
            ApprovalState::Approved => {}
            ApprovalState::Rejected => {
                metrics::record_provisioning("login", "rejected");
                return Err(ServiceError::RegistrationRejected);
            }
            state => {
                metrics::record_provisioning("login", "pending_approval");
                return Err(ServiceError::PendingApproval { state });
            }
        }

        // Before minting: a failed login must not leave a refresh session behind
        self.store
            .record_login(account.account_id, Utc::now())
            .await?;
        let tokens = self.sessions.mint(&account).await?;

        tracing::info!(account_id = %account.account_id, role = %account.role, "Login succeeded");
        metrics::record_provisioning("login", "success");
        Ok(tokens)
    }

    /// Resend for the account behind `login`, at most once per cooldown window.
    /// Unknown or already verified logins are a silent no-op.
    pub async fn resend_verification(&self, login: &str) -> Result<(), ServiceError> {
        let Some(account) = self.store.find_account_by_login(login.trim()).await? else {
            return Ok(());
        };
        if account.email_verified {
            return Ok(());
        }

        if self.resend_cooldown_seconds > 0 {
            let key = format!("resend:{}", account.account_id);
            let claimed = self
                .cache
                .claim_cooldown(&key, self.resend_cooldown_seconds)
                .await
                .map_err(ServiceError::Unavailable)?;
            if !claimed {
                tracing::info!(account_id = %account.account_id, "Verification resend throttled");
                metrics::record_provisioning("verification", "resend_throttled");
                return Ok(());
            }
        }

        self.verification.resend(account.account_id).await?;
        Ok(())
    }

    /// Verify the current secret, store the new one and revoke every session.
    pub async fn change_password(
        &self,
        account_id: Uuid,
        current_password: String,
        new_password: String,
    ) -> Result<i64, ServiceError> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        if !verify_password(&Password::new(current_password), &account.secret_hash)? {
            return Err(ServiceError::InvalidCredentials);
        }

        let secret_hash = hash_password(&Password::new(new_password))?;
        self.store.update_secret(account_id, &secret_hash).await?;
        let epoch = self.sessions.revoke(account_id).await?;

        tracing::info!(account_id = %account_id, "Password changed");
        Ok(epoch)
    }

    /// Create the first administrator, already verified and approved. Refused once any
    /// live admin exists.
    pub async fn bootstrap_admin(
        &self,
        req: BootstrapAdminRequest,
    ) -> Result<BootstrapAdminResponse, ServiceError> {
        if self.store.role_exists(Role::Admin).await? {
            return Err(ServiceError::AdminAlreadyExists);
        }

        let secret_hash = hash_password(&Password::new(req.password))?;
        let mut account = Account::new(
            req.login.trim().to_string(),
            req.email.trim().to_lowercase(),
            secret_hash,
            Role::Admin,
            json!({ "full_name": req.full_name }),
        );
        account.email_verified = true;
        account.approval_state = ApprovalState::Approved;

        self.store.insert_account(&account).await?;

        tracing::warn!(account_id = %account.account_id, "Bootstrap administrator created");
        Ok(BootstrapAdminResponse {
            account_id: account.account_id,
            approval_state: account.approval_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MockSessionCache;
    use crate::services::email::MockEmailService;
    use crate::services::jwt::JwtService;
    use crate::models::{ApprovalDecision, PermissionOverride, RefreshSession, VerificationToken};
    use crate::services::store::{
        ApprovalTransition, ConsumeOutcome, InMemoryCredentialStore, NextStateFn,
        RolePermissionDocument, StoreError, TransitionOutcome,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/jwt_private.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/jwt_public.pem");

    struct Harness {
        store: Arc<InMemoryCredentialStore>,
        email: Arc<MockEmailService>,
        verification: Arc<VerificationCoordinator>,
        sessions: Arc<SessionIssuer>,
        accounts: AccountService,
    }

    fn harness(resend_cooldown_seconds: u64) -> Harness {
        let store = Arc::new(InMemoryCredentialStore::new());
        let email = Arc::new(MockEmailService::new());
        let cache: Arc<dyn SessionCache> = Arc::new(MockSessionCache::new());
        let policy = Arc::new(ReviewPolicy::default());
        let jwt = Arc::new(JwtService::from_pem(PRIVATE_KEY, PUBLIC_KEY, 15, 7).unwrap());
        let verification = Arc::new(VerificationCoordinator::new(
            store.clone(),
            email.clone(),
            policy.clone(),
            Duration::hours(24),
            "http://portal.test".into(),
        ));
        let sessions = Arc::new(SessionIssuer::new(store.clone(), jwt, cache.clone()));
        let accounts = AccountService::new(
            store.clone(),
            policy,
            verification.clone(),
            sessions.clone(),
            cache,
            resend_cooldown_seconds,
        );
        Harness {
            store,
            email,
            verification,
            sessions,
            accounts,
        }
    }

    fn doctor(login: &str) -> RegisterRequest {
        RegisterRequest {
            login: login.into(),
            email: format!("{}@example.org", login),
            password: "CorrectHorse42!".into(),
            role: Role::Doctor,
            profile: json!({
                "full_name": "Gregory House",
                "license_number": "MD-1234",
                "specialization": "diagnostics"
            }),
        }
    }

    fn login(login: &str, password: &str) -> LoginRequest {
        LoginRequest {
            login: login.into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn test_login_gate_reports_each_stage() {
        let h = harness(0);
        let registered = h.accounts.register(doctor("house")).await.unwrap();
        assert_eq!(registered.approval_state, ApprovalState::PendingEmailVerification);

        let err = h.accounts.login(login("house", "wrong")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));

        let err = h.accounts.login(login("house", "CorrectHorse42!")).await.unwrap_err();
        assert!(matches!(err, ServiceError::EmailNotVerified { account_id } if account_id == registered.account_id));

        let token = h.email.last_verification_token("house@example.org").unwrap();
        h.verification.consume_token(&token).await.unwrap();

        let err = h.accounts.login(login("HOUSE", "CorrectHorse42!")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::PendingApproval {
                state: ApprovalState::PendingAdminApproval
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_login_is_invalid_credentials() {
        let h = harness(0);
        let err = h.accounts.login(login("nobody", "whatever")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_logins_are_unique_case_insensitively() {
        let h = harness(0);
        h.accounts.register(doctor("wilson")).await.unwrap();
        let err = h.accounts.register(doctor("Wilson")).await.unwrap_err();
        assert!(matches!(err, ServiceError::LoginTaken));
    }

    #[tokio::test]
    async fn test_registration_enforces_the_policy_table() {
        let h = harness(0);

        let mut admin = doctor("mallory");
        admin.role = Role::Admin;
        let err = h.accounts.register(admin).await.unwrap_err();
        assert!(matches!(&err, ServiceError::Validation(fields) if fields[0].field == "role"));

        let mut incomplete = doctor("cuddy");
        incomplete.profile = json!({ "full_name": "Lisa Cuddy" });
        let ServiceError::Validation(fields) = h.accounts.register(incomplete).await.unwrap_err() else {
            panic!("expected validation failure");
        };
        let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["profile.license_number", "profile.specialization"]);
    }

    #[tokio::test]
    async fn test_resend_is_throttled_per_account() {
        let h = harness(60);
        h.accounts.register(doctor("chase")).await.unwrap();
        let first = h.email.last_verification_token("chase@example.org").unwrap();

        h.accounts.resend_verification("chase").await.unwrap();
        let second = h.email.last_verification_token("chase@example.org").unwrap();
        assert_ne!(first, second);

        h.accounts.resend_verification("chase").await.unwrap();
        let third = h.email.last_verification_token("chase@example.org").unwrap();
        assert_eq!(second, third);

        // Unknown logins are silently ignored.
        h.accounts.resend_verification("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn test_approved_patient_logs_in_and_password_change_revokes_sessions() {
        let h = harness(0);
        let mut req = doctor("patty");
        req.role = Role::Patient;
        req.profile = json!({ "full_name": "Patty P", "date_of_birth": "1990-01-01" });
        let registered = h.accounts.register(req).await.unwrap();

        let token = h.email.last_verification_token("patty@example.org").unwrap();
        let verified = h.verification.consume_token(&token).await.unwrap();
        assert_eq!(verified.approval_state, ApprovalState::Approved);

        let tokens = h.accounts.login(login("patty", "CorrectHorse42!")).await.unwrap();
        let stored = h.store.find_account(registered.account_id).await.unwrap().unwrap();
        assert!(stored.last_login_utc.is_some());

        let err = h
            .accounts
            .change_password(registered.account_id, "wrong".into(), "NewSecret99!".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));

        h.accounts
            .change_password(
                registered.account_id,
                "CorrectHorse42!".into(),
                "NewSecret99!".into(),
            )
            .await
            .unwrap();

        assert!(h.sessions.authenticate(&tokens.access_token).await.is_err());
        assert!(h.accounts.login(login("patty", "CorrectHorse42!")).await.is_err());
        assert!(h.accounts.login(login("patty", "NewSecret99!")).await.is_ok());
    }

    /// Delegates to the in-memory store, except that `record_login` always fails.
    /// Counts refresh sessions created through it.
    struct LoginRecordFails {
        inner: InMemoryCredentialStore,
        sessions_created: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for LoginRecordFails {
        async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
            self.inner.insert_account(account).await
        }
        async fn find_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
            self.inner.find_account(id).await
        }
        async fn find_account_by_login(&self, login: &str) -> Result<Option<Account>, StoreError> {
            self.inner.find_account_by_login(login).await
        }
        async fn role_exists(&self, role: Role) -> Result<bool, StoreError> {
            self.inner.role_exists(role).await
        }
        async fn accounts_in_state(&self, state: ApprovalState) -> Result<Vec<Account>, StoreError> {
            self.inner.accounts_in_state(state).await
        }
        async fn record_login(&self, _: Uuid, _: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable(anyhow::anyhow!("write lost")))
        }
        async fn update_secret(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
            self.inner.update_secret(id, hash).await
        }
        async fn issue_verification_token(&self, token: &VerificationToken) -> Result<(), StoreError> {
            self.inner.issue_verification_token(token).await
        }
        async fn consume_verification_token(
            &self,
            token: &str,
            now: DateTime<Utc>,
            next_state: &NextStateFn,
        ) -> Result<ConsumeOutcome, StoreError> {
            self.inner.consume_verification_token(token, now, next_state).await
        }
        async fn transition_approval(
            &self,
            transition: &ApprovalTransition,
        ) -> Result<TransitionOutcome, StoreError> {
            self.inner.transition_approval(transition).await
        }
        async fn decisions_for(&self, id: Uuid) -> Result<Vec<ApprovalDecision>, StoreError> {
            self.inner.decisions_for(id).await
        }
        async fn create_refresh_session(&self, session: &RefreshSession) -> Result<(), StoreError> {
            self.sessions_created.fetch_add(1, Ordering::SeqCst);
            self.inner.create_refresh_session(session).await
        }
        async fn find_refresh_session(&self, id: Uuid) -> Result<Option<RefreshSession>, StoreError> {
            self.inner.find_refresh_session(id).await
        }
        async fn revoke_refresh_session(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.revoke_refresh_session(id).await
        }
        async fn revoke_all_sessions(&self, id: Uuid) -> Result<i64, StoreError> {
            self.inner.revoke_all_sessions(id).await
        }
        async fn overrides_for(&self, id: Uuid) -> Result<Vec<PermissionOverride>, StoreError> {
            self.inner.overrides_for(id).await
        }
        async fn replace_overrides(
            &self,
            id: Uuid,
            overrides: &[PermissionOverride],
        ) -> Result<(), StoreError> {
            self.inner.replace_overrides(id, overrides).await
        }
        async fn load_permission_matrix(
            &self,
        ) -> Result<Option<(i64, RolePermissionDocument)>, StoreError> {
            self.inner.load_permission_matrix().await
        }
        async fn save_permission_matrix(
            &self,
            expected_version: i64,
            document: &RolePermissionDocument,
            updated_by: Option<Uuid>,
        ) -> Result<(), StoreError> {
            self.inner
                .save_permission_matrix(expected_version, document, updated_by)
                .await
        }
        async fn health_check(&self) -> Result<(), StoreError> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn test_failed_login_write_mints_no_session() {
        let store = Arc::new(LoginRecordFails {
            inner: InMemoryCredentialStore::new(),
            sessions_created: AtomicUsize::new(0),
        });
        let mut account = Account::new(
            "nurse.ratched".into(),
            "ratched@example.org".into(),
            hash_password(&Password::new("CorrectHorse42!")).unwrap(),
            Role::Nurse,
            json!({}),
        );
        account.email_verified = true;
        account.approval_state = ApprovalState::Approved;
        store.insert_account(&account).await.unwrap();

        let cache: Arc<dyn SessionCache> = Arc::new(MockSessionCache::new());
        let policy = Arc::new(ReviewPolicy::default());
        let jwt = Arc::new(JwtService::from_pem(PRIVATE_KEY, PUBLIC_KEY, 15, 7).unwrap());
        let verification = Arc::new(VerificationCoordinator::new(
            store.clone(),
            Arc::new(MockEmailService::new()),
            policy.clone(),
            Duration::hours(24),
            "http://portal.test".into(),
        ));
        let sessions = Arc::new(SessionIssuer::new(store.clone(), jwt, cache.clone()));
        let accounts = AccountService::new(store.clone(), policy, verification, sessions, cache, 0);

        let err = accounts
            .login(login("nurse.ratched", "CorrectHorse42!"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert_eq!(store.sessions_created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_one_admin() {
        let h = harness(0);
        let req = || BootstrapAdminRequest {
            login: "root".into(),
            email: "root@example.org".into(),
            password: "a-long-admin-secret".into(),
            full_name: "Hospital IT".into(),
        };

        let created = h.accounts.bootstrap_admin(req()).await.unwrap();
        assert_eq!(created.approval_state, ApprovalState::Approved);
        assert!(h.accounts.login(login("root", "a-long-admin-secret")).await.is_ok());

        let err = h.accounts.bootstrap_admin(req()).await.unwrap_err();
        assert!(matches!(err, ServiceError::AdminAlreadyExists));
    }
}
