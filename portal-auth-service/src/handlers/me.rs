use axum::{extract::State, Json};

use crate::{
    dtos::{
        auth::{ChangePasswordRequest, MeResponse},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    services::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// Current account and its effective permissions
#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Current account", body = MeResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
) -> Result<Json<MeResponse>, ServiceError> {
    let account = state
        .store
        .find_account(subject.account_id)
        .await?
        .ok_or(ServiceError::AccountNotFound)?;

    let permissions = state
        .authz
        .effective_permissions(&subject)
        .into_iter()
        .map(|p| p.to_string())
        .collect();

    Ok(Json(MeResponse {
        account: account.sanitized(),
        token_role: subject.role,
        permissions,
    }))
}

/// Change password
///
/// Every session of the account, including the current one, is revoked.
#[utoipa::path(
    post,
    path = "/me/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse),
        (status = 403, description = "Current password is wrong", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, ServiceError> {
    if req.current_password == req.new_password {
        return Err(ServiceError::validation(
            "new_password",
            "must differ from the current password",
        ));
    }

    state
        .accounts
        .change_password(subject.account_id, req.current_password, req.new_password)
        .await?;

    Ok(Json(MessageResponse::new(
        "Password changed. All sessions have been revoked.",
    )))
}
