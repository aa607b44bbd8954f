pub mod access;
pub mod bootstrap;
pub mod reviews;

pub use access::{
    get_permission_overrides, get_role_permissions, put_permission_overrides, revoke_sessions,
    set_role_permissions,
};
pub use bootstrap::bootstrap_admin;
pub use reviews::{approve_account, decision_history, pending_accounts, reject_account, revoke_approval};

use axum::extract::{rejection::PathRejection, Path};
use uuid::Uuid;

use crate::services::ServiceError;

/// `:account_id` path segment, with a field error instead of axum's plain-text rejection.
fn account_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ServiceError> {
    path.map(|Path(id)| id)
        .map_err(|_| ServiceError::validation("account_id", "must be a UUID"))
}
