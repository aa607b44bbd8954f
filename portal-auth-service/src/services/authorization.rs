//! Authorization engine: allow/deny for an authenticated subject, combining the approval
//! gate, per-account overrides and the role permission matrix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{ApprovalState, OverrideEffect, Permission, PermissionOverride, Role};
use crate::services::error::ServiceError;
use crate::services::metrics;
use crate::services::permission_matrix::PermissionMatrix;
use crate::services::store::CredentialStore;

/// An authenticated caller as seen by the authorization engine. `role` is the snapshot
/// taken when the access token was minted; `approval_state` is current.
#[derive(Debug, Clone)]
pub struct AccessSubject {
    pub account_id: Uuid,
    pub role: Role,
    pub approval_state: ApprovalState,
    pub overrides: Vec<PermissionOverride>,
    pub token_id: String,
    pub token_expiry: i64,
}

impl AccessSubject {
    fn override_for(&self, permission: &Permission) -> Option<OverrideEffect> {
        self.overrides
            .iter()
            .find(|o| &o.permission == permission)
            .map(|o| o.effect)
    }
}

pub struct AuthorizationEngine {
    matrix: Arc<PermissionMatrix>,
    store: Arc<dyn CredentialStore>,
}

impl AuthorizationEngine {
    pub fn new(matrix: Arc<PermissionMatrix>, store: Arc<dyn CredentialStore>) -> Self {
        Self { matrix, store }
    }

    pub fn matrix(&self) -> &Arc<PermissionMatrix> {
        &self.matrix
    }

    /// Unapproved accounts can do nothing. Otherwise a deny override wins, then a grant
    /// override, then the role's entry in the matrix.
    pub fn can(&self, subject: &AccessSubject, permission: &Permission) -> bool {
        if subject.approval_state != ApprovalState::Approved {
            return false;
        }
        match subject.override_for(permission) {
            Some(OverrideEffect::Deny) => false,
            Some(OverrideEffect::Grant) => true,
            None => self.matrix.has_permission(subject.role, permission),
        }
    }

    pub fn require(&self, subject: &AccessSubject, permission: &Permission) -> Result<(), ServiceError> {
        if self.can(subject, permission) {
            return Ok(());
        }
        metrics::record_authorization_denied(permission.as_str());
        tracing::warn!(
            account_id = %subject.account_id,
            role = %subject.role,
            permission = %permission,
            "Permission denied"
        );
        Err(ServiceError::Forbidden {
            permission: permission.to_string(),
        })
    }

    /// Every permission `can` would allow for the subject right now.
    pub fn effective_permissions(&self, subject: &AccessSubject) -> BTreeSet<Permission> {
        Permission::all().filter(|p| self.can(subject, p)).collect()
    }

    pub async fn overrides(&self, account_id: Uuid) -> Result<Vec<PermissionOverride>, ServiceError> {
        if self.store.find_account(account_id).await?.is_none() {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(self.store.overrides_for(account_id).await?)
    }

    /// Replaces the account's override set. Ids must come from the catalog.
    pub async fn set_overrides(
        &self,
        account_id: Uuid,
        requested: &BTreeMap<String, OverrideEffect>,
        updated_by: Uuid,
    ) -> Result<Vec<PermissionOverride>, ServiceError> {
        let mut unknown = Vec::new();
        let mut overrides = Vec::with_capacity(requested.len());
        for (id, effect) in requested {
            match id.parse::<Permission>() {
                Ok(permission) => overrides.push(PermissionOverride {
                    account_id,
                    permission,
                    effect: *effect,
                }),
                Err(id) => unknown.push(id),
            }
        }
        if !unknown.is_empty() {
            return Err(ServiceError::UnknownPermission(unknown));
        }

        self.store.replace_overrides(account_id, &overrides).await?;
        tracing::info!(
            account_id = %account_id,
            updated_by = %updated_by,
            count = overrides.len(),
            "Permission overrides replaced"
        );
        Ok(overrides)
    }
}
