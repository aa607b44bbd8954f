use axum::{extract::State, Json};

use crate::{
    dtos::{
        auth::{LoginRequest, LogoutRequest, RefreshRequest},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    services::{ServiceError, TokenResponse},
    utils::ValidatedJson,
    AppState,
};

/// Log in with login and password
///
/// Each refusal carries a distinct code: `InvalidCredentials`, `EmailNotVerified`
/// (with the resend path), `PendingApproval` or `RegistrationRejected`.
#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = TokenResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
        (status = 403, description = "Login refused", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Json<TokenResponse>, ServiceError> {
    Ok(Json(state.accounts.login(req).await?))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = TokenResponse),
        (status = 401, description = "Invalid, revoked or replayed refresh token", body = ErrorResponse),
        (status = 403, description = "Account no longer approved", body = ErrorResponse)
    ),
    tag = "Session"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<Json<TokenResponse>, ServiceError> {
    Ok(Json(state.sessions.refresh(&req.refresh_token).await?))
}

/// Log out
///
/// Blacklists the presented access token and revokes the refresh session.
#[utoipa::path(
    post,
    path = "/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Unauthenticated", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Session"
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(subject): AuthUser,
    ValidatedJson(req): ValidatedJson<LogoutRequest>,
) -> Result<Json<MessageResponse>, ServiceError> {
    state.sessions.logout(&subject, &req.refresh_token).await?;
    Ok(Json(MessageResponse::new("Logged out")))
}
