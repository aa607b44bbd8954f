//! Session issuer: turns a provisioned account into a token pair and resolves presented
//! access tokens back into an [`AccessSubject`].
//!
//! Revocation is epoch based. Every token carries the account's `session_epoch` at
//! issuance (`sep`); bumping the stored epoch kills every outstanding access token on its
//! next use, and every refresh token on its next rotation.

use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Account, RefreshSession};
use crate::services::authorization::AccessSubject;
use crate::services::cache::SessionCache;
use crate::services::error::ServiceError;
use crate::services::jwt::{JwtService, TokenResponse};
use crate::services::store::CredentialStore;

pub struct SessionIssuer {
    store: Arc<dyn CredentialStore>,
    jwt: Arc<JwtService>,
    cache: Arc<dyn SessionCache>,
}

impl SessionIssuer {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        jwt: Arc<JwtService>,
        cache: Arc<dyn SessionCache>,
    ) -> Self {
        Self { store, jwt, cache }
    }

    /// Issue a token pair for `account_id`. `NotApproved` unless the account is approved
    /// and its email verified.
    pub async fn issue(&self, account_id: Uuid) -> Result<TokenResponse, ServiceError> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        self.mint(&account).await
    }

    /// Issue for an account the caller has already loaded.
    pub async fn mint(&self, account: &Account) -> Result<TokenResponse, ServiceError> {
        if !account.is_provisioned() {
            return Err(ServiceError::NotApproved);
        }

        let session_id = Uuid::new_v4();
        let access_token =
            self.jwt
                .generate_access_token(account.account_id, account.role, account.session_epoch)?;
        let refresh_token =
            self.jwt
                .generate_refresh_token(account.account_id, session_id, account.session_epoch)?;

        let session = RefreshSession::new(
            session_id,
            account.account_id,
            RefreshSession::hash_token(&refresh_token),
            self.jwt.refresh_token_expiry_days(),
        );
        self.store.create_refresh_session(&session).await?;

        tracing::debug!(
            account_id = %account.account_id,
            session_id = %session_id,
            "Session issued"
        );

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }

    /// Rotate a refresh token. Approval, verification and the session epoch are checked
    /// against current state, and the new pair carries a fresh role snapshot.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ServiceError> {
        let claims = self
            .jwt
            .validate_refresh_token(refresh_token)
            .map_err(|_| ServiceError::InvalidToken)?;
        let session_id = Uuid::parse_str(&claims.jti).map_err(|_| ServiceError::InvalidToken)?;

        let session = self
            .store
            .find_refresh_session(session_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if !session.is_valid() || session.account_id.to_string() != claims.sub {
            return Err(ServiceError::InvalidToken);
        }

        if !session.matches_token(refresh_token) {
            tracing::warn!(session_id = %session_id, "Refresh token hash mismatch");
            return Err(ServiceError::InvalidToken);
        }

        let account = self
            .store
            .find_account(session.account_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if claims.sep != account.session_epoch {
            return Err(ServiceError::InvalidToken);
        }

        if !account.is_provisioned() {
            self.store.revoke_refresh_session(session_id).await?;
            return Err(ServiceError::NotApproved);
        }

        // Conditional revoke: of two concurrent rotations of one token only one proceeds.
        if !self.store.revoke_refresh_session(session_id).await? {
            tracing::warn!(
                account_id = %account.account_id,
                session_id = %session_id,
                "Refresh token replayed"
            );
            return Err(ServiceError::InvalidToken);
        }

        let tokens = self.mint(&account).await?;
        tracing::info!(account_id = %account.account_id, "Session refreshed");
        Ok(tokens)
    }

    /// Kill every session of the account. Returns the new session epoch.
    pub async fn revoke(&self, account_id: Uuid) -> Result<i64, ServiceError> {
        let epoch = self.store.revoke_all_sessions(account_id).await?;
        tracing::info!(account_id = %account_id, session_epoch = epoch, "All sessions revoked");
        Ok(epoch)
    }

    /// Resolve a bearer token into the subject the authorization engine evaluates.
    pub async fn authenticate(&self, access_token: &str) -> Result<AccessSubject, ServiceError> {
        let claims = self
            .jwt
            .validate_access_token(access_token)
            .map_err(|_| ServiceError::InvalidToken)?;

        if self
            .cache
            .is_blacklisted(&claims.jti)
            .await
            .map_err(ServiceError::Unavailable)?
        {
            return Err(ServiceError::InvalidToken);
        }

        let account_id = Uuid::parse_str(&claims.sub).map_err(|_| ServiceError::InvalidToken)?;
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if claims.sep != account.session_epoch {
            return Err(ServiceError::InvalidToken);
        }

        let overrides = self.store.overrides_for(account_id).await?;

        Ok(AccessSubject {
            account_id,
            role: claims.role,
            approval_state: account.approval_state,
            overrides,
            token_id: claims.jti,
            token_expiry: claims.exp,
        })
    }

    /// Blacklist the presented access token until it expires and revoke the refresh
    /// session it was paired with.
    pub async fn logout(
        &self,
        subject: &AccessSubject,
        refresh_token: &str,
    ) -> Result<(), ServiceError> {
        let claims = self
            .jwt
            .validate_refresh_token(refresh_token)
            .map_err(|_| ServiceError::InvalidToken)?;
        if claims.sub != subject.account_id.to_string() {
            return Err(ServiceError::InvalidToken);
        }
        let session_id = Uuid::parse_str(&claims.jti).map_err(|_| ServiceError::InvalidToken)?;

        let remaining = subject.token_expiry - chrono::Utc::now().timestamp();
        if remaining > 0 {
            self.cache
                .blacklist_token(&subject.token_id, remaining)
                .await
                .map_err(ServiceError::Unavailable)?;
        }

        self.store.revoke_refresh_session(session_id).await?;

        tracing::info!(account_id = %subject.account_id, "Account logged out");
        Ok(())
    }
}
