use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::{
    dtos::{
        auth::{
            RegisterRequest, RegisterResponse, ResendVerificationRequest, VerifyEmailQuery,
            VerifyEmailResponse,
        },
        ErrorResponse, MessageResponse,
    },
    services::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// Register a new account
///
/// The account starts in `pending_email_verification` and a verification link is sent
/// to `email`.
#[utoipa::path(
    post,
    path = "/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account registered", body = RegisterResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
        (status = 409, description = "Login already registered", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Registration"
)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let res = state.accounts.register(req).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

/// Consume an email verification token
#[utoipa::path(
    get,
    path = "/verify-email",
    params(VerifyEmailQuery),
    responses(
        (status = 200, description = "Email verified", body = VerifyEmailResponse),
        (status = 404, description = "Unknown token", body = ErrorResponse),
        (status = 410, description = "Token expired, already used or superseded", body = ErrorResponse)
    ),
    tag = "Registration"
)]
pub async fn verify_email(
    State(state): State<AppState>,
    query: Result<Query<VerifyEmailQuery>, QueryRejection>,
) -> Result<Json<VerifyEmailResponse>, ServiceError> {
    let Query(query) = query.map_err(|_| ServiceError::validation("token", "is required"))?;
    let token = query.token.trim();
    if token.is_empty() {
        return Err(ServiceError::validation("token", "is required"));
    }

    let verified = state.verification.consume_token(token).await?;
    Ok(Json(VerifyEmailResponse {
        account_id: verified.account_id,
        approval_state: verified.approval_state,
    }))
}

/// Resend the verification email
///
/// Always answers 200 so the endpoint does not reveal which logins exist.
#[utoipa::path(
    post,
    path = "/resend-verification",
    request_body = ResendVerificationRequest,
    responses(
        (status = 200, description = "Request accepted", body = MessageResponse)
    ),
    tag = "Registration"
)]
pub async fn resend_verification(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ResendVerificationRequest>,
) -> Json<MessageResponse> {
    if let Err(e) = state.accounts.resend_verification(&req.login).await {
        tracing::warn!(code = e.code(), error = %e, "Verification resend failed");
    }
    Json(MessageResponse::new(
        "If the account exists and is unverified, a new verification link has been sent.",
    ))
}
