use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::dtos::{ErrorResponse, FieldError};
use crate::models::ApprovalState;
use crate::services::store::StoreError;

/// Domain errors. Each variant maps to one HTTP status and one stable `code`.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Login is already registered")]
    LoginTaken,

    #[error("Verification token not found")]
    TokenNotFound,

    #[error("Verification token has expired")]
    TokenExpired,

    #[error("Verification token has already been used")]
    TokenAlreadyUsed,

    #[error("Verification token was replaced by a newer one")]
    TokenSuperseded,

    #[error("Invalid login or password")]
    InvalidCredentials,

    #[error("Email address has not been verified")]
    EmailNotVerified { account_id: Uuid },

    #[error("Account is awaiting approval")]
    PendingApproval { state: ApprovalState },

    #[error("Registration was rejected")]
    RegistrationRejected,

    #[error("Account is not approved for sessions")]
    NotApproved,

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Invalid or revoked token")]
    InvalidToken,

    #[error("Missing permission: {permission}")]
    Forbidden { permission: String },

    #[error("Cannot {action} an account in state {from}")]
    InvalidStateTransition {
        from: ApprovalState,
        action: &'static str,
    },

    #[error("Account has already been decided: {state}")]
    AlreadyDecided { state: ApprovalState },

    #[error("Account not found")]
    AccountNotFound,

    #[error("Unknown permission ids")]
    UnknownPermission(Vec<String>),

    #[error("Admin permissions are computed from the catalog and cannot be set")]
    AdminPermissionsComputed,

    #[error("Permission matrix was changed concurrently")]
    MatrixVersionConflict,

    #[error("An administrator account already exists")]
    AdminAlreadyExists,

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        ServiceError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "ValidationFailed",
            ServiceError::LoginTaken => "LoginTaken",
            ServiceError::TokenNotFound => "TokenNotFound",
            ServiceError::TokenExpired => "TokenExpired",
            ServiceError::TokenAlreadyUsed => "TokenAlreadyUsed",
            ServiceError::TokenSuperseded => "TokenSuperseded",
            ServiceError::InvalidCredentials => "InvalidCredentials",
            ServiceError::EmailNotVerified { .. } => "EmailNotVerified",
            ServiceError::PendingApproval { .. } => "PendingApproval",
            ServiceError::RegistrationRejected => "RegistrationRejected",
            ServiceError::NotApproved => "NotApproved",
            ServiceError::Unauthenticated(_) => "Unauthenticated",
            ServiceError::InvalidToken => "InvalidToken",
            ServiceError::Forbidden { .. } => "Forbidden",
            ServiceError::InvalidStateTransition { .. } => "InvalidStateTransition",
            ServiceError::AlreadyDecided { .. } => "AlreadyDecided",
            ServiceError::AccountNotFound => "AccountNotFound",
            ServiceError::UnknownPermission(_) => "UnknownPermission",
            ServiceError::AdminPermissionsComputed => "AdminPermissionsComputed",
            ServiceError::MatrixVersionConflict => "MatrixVersionConflict",
            ServiceError::AdminAlreadyExists => "AdminAlreadyExists",
            ServiceError::Unavailable(_) => "ServiceUnavailable",
            ServiceError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InvalidStateTransition { .. }
            | ServiceError::UnknownPermission(_)
            | ServiceError::AdminPermissionsComputed => StatusCode::BAD_REQUEST,
            ServiceError::LoginTaken
            | ServiceError::AlreadyDecided { .. }
            | ServiceError::MatrixVersionConflict
            | ServiceError::AdminAlreadyExists => StatusCode::CONFLICT,
            ServiceError::TokenNotFound | ServiceError::AccountNotFound => StatusCode::NOT_FOUND,
            ServiceError::TokenExpired
            | ServiceError::TokenAlreadyUsed
            | ServiceError::TokenSuperseded => StatusCode::GONE,
            ServiceError::InvalidCredentials
            | ServiceError::EmailNotVerified { .. }
            | ServiceError::PendingApproval { .. }
            | ServiceError::RegistrationRejected
            | ServiceError::NotApproved
            | ServiceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ServiceError::Unauthenticated(_) | ServiceError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Remediation hints for the client.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Validation(fields) => Some(json!({ "fields": fields })),
            ServiceError::EmailNotVerified { account_id } => Some(json!({
                "account_id": account_id,
                "resend_path": "/resend-verification",
            })),
            ServiceError::PendingApproval { state } => Some(json!({ "approval_state": state })),
            ServiceError::Forbidden { permission } => Some(json!({ "permission": permission })),
            ServiceError::InvalidStateTransition { from, .. } => {
                Some(json!({ "approval_state": from }))
            }
            ServiceError::AlreadyDecided { state } => Some(json!({ "approval_state": state })),
            ServiceError::UnknownPermission(ids) => Some(json!({ "unknown": ids })),
            _ => None,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LoginTaken => ServiceError::LoginTaken,
            StoreError::AccountNotFound => ServiceError::AccountNotFound,
            StoreError::VersionConflict { .. } => ServiceError::MatrixVersionConflict,
            StoreError::Unavailable(e) => ServiceError::Unavailable(e),
            StoreError::Internal(e) => ServiceError::Internal(e),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServiceError::Unavailable(e) => {
                tracing::error!(error = %e, "Backing store unavailable");
                "Service temporarily unavailable".to_string()
            }
            ServiceError::Internal(e) => {
                tracing::error!(error = %e, "Internal server error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: message,
            code: self.code().to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            other => AppError::InternalError(anyhow::anyhow!(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_state_errors_are_gone() {
        for err in [
            ServiceError::TokenExpired,
            ServiceError::TokenAlreadyUsed,
            ServiceError::TokenSuperseded,
        ] {
            assert_eq!(err.status(), StatusCode::GONE);
        }
        assert_eq!(ServiceError::TokenNotFound.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_login_gate_errors_are_forbidden_with_distinct_codes() {
        let errors = [
            ServiceError::InvalidCredentials,
            ServiceError::EmailNotVerified {
                account_id: Uuid::new_v4(),
            },
            ServiceError::PendingApproval {
                state: ApprovalState::PendingAdminApproval,
            },
            ServiceError::RegistrationRejected,
        ];
        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        assert!(errors.iter().all(|e| e.status() == StatusCode::FORBIDDEN));
        assert_eq!(
            codes,
            vec![
                "InvalidCredentials",
                "EmailNotVerified",
                "PendingApproval",
                "RegistrationRejected"
            ]
        );
    }

    #[test]
    fn test_email_not_verified_points_at_resend() {
        let account_id = Uuid::new_v4();
        let details = ServiceError::EmailNotVerified { account_id }
            .details()
            .unwrap();
        assert_eq!(details["account_id"], json!(account_id));
        assert_eq!(details["resend_path"], "/resend-verification");
    }

    #[test]
    fn test_store_outage_is_never_a_state_error() {
        let err: ServiceError = StoreError::Unavailable(anyhow::anyhow!("down")).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "ServiceUnavailable");
    }
}
