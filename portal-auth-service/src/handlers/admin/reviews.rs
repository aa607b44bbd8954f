use axum::{
    extract::{rejection::PathRejection, Path, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use super::account_id;
use crate::{
    dtos::{
        admin::{DecisionHistoryResponse, DecisionRequest, DecisionResponse, PendingAccountsResponse},
        ErrorResponse,
    },
    middleware::AuthUser,
    services::{DecisionOutcome, ServiceError},
    utils::validation::field_errors,
    AppState,
};

fn notes(body: Option<Json<DecisionRequest>>) -> Result<Option<String>, ServiceError> {
    let Json(req) = body.unwrap_or_default();
    req.validate()
        .map_err(|e| ServiceError::Validation(field_errors(&e)))?;
    Ok(req.notes.filter(|n| !n.trim().is_empty()))
}

fn respond(outcome: DecisionOutcome) -> Json<DecisionResponse> {
    Json(DecisionResponse {
        account_id: outcome.account.account_id,
        approval_state: outcome.account.approval_state,
        decision: outcome.decision,
    })
}

/// Approve an account waiting for review
#[utoipa::path(
    post,
    path = "/admin/approve/{account_id}",
    params(("account_id" = Uuid, Path, description = "Account to approve")),
    request_body(content = Option<DecisionRequest>, description = "Optional reviewer notes"),
    responses(
        (status = 200, description = "Account approved", body = DecisionResponse),
        (status = 400, description = "Account is not awaiting review", body = ErrorResponse),
        (status = 403, description = "Missing system.approve_accounts", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 409, description = "Account already decided", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn approve_account(
    State(state): State<AppState>,
    AuthUser(reviewer): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let outcome = state
        .approvals
        .approve(account_id, reviewer.account_id, notes(body)?)
        .await?;
    Ok(respond(outcome))
}

/// Reject an account waiting for review
#[utoipa::path(
    post,
    path = "/admin/reject/{account_id}",
    params(("account_id" = Uuid, Path, description = "Account to reject")),
    request_body(content = Option<DecisionRequest>, description = "Optional reviewer notes"),
    responses(
        (status = 200, description = "Account rejected", body = DecisionResponse),
        (status = 400, description = "Account is not awaiting review", body = ErrorResponse),
        (status = 403, description = "Missing system.approve_accounts", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse),
        (status = 409, description = "Account already decided", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn reject_account(
    State(state): State<AppState>,
    AuthUser(reviewer): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let outcome = state
        .approvals
        .reject(account_id, reviewer.account_id, notes(body)?)
        .await?;
    Ok(respond(outcome))
}

/// Withdraw an earlier approval
///
/// Moves the account to `rejected` and revokes all of its sessions.
#[utoipa::path(
    post,
    path = "/admin/revoke-approval/{account_id}",
    params(("account_id" = Uuid, Path, description = "Approved account")),
    request_body(content = Option<DecisionRequest>, description = "Optional reviewer notes"),
    responses(
        (status = 200, description = "Approval revoked", body = DecisionResponse),
        (status = 400, description = "Account is not approved", body = ErrorResponse),
        (status = 409, description = "Account already rejected", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn revoke_approval(
    State(state): State<AppState>,
    AuthUser(reviewer): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let outcome = state
        .approvals
        .revoke_approval(account_id, reviewer.account_id, notes(body)?)
        .await?;
    Ok(respond(outcome))
}

/// Accounts waiting for admin review
#[utoipa::path(
    get,
    path = "/admin/accounts/pending",
    responses(
        (status = 200, description = "Pending accounts", body = PendingAccountsResponse),
        (status = 403, description = "Missing system.approve_accounts", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn pending_accounts(
    State(state): State<AppState>,
) -> Result<Json<PendingAccountsResponse>, ServiceError> {
    let accounts = state
        .approvals
        .pending_reviews()
        .await?
        .iter()
        .map(|a| a.sanitized())
        .collect();
    Ok(Json(PendingAccountsResponse { accounts }))
}

/// Review history of one account, oldest first
#[utoipa::path(
    get,
    path = "/admin/accounts/{account_id}/decisions",
    params(("account_id" = Uuid, Path, description = "Account")),
    responses(
        (status = 200, description = "Decision history", body = DecisionHistoryResponse),
        (status = 404, description = "Account not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn decision_history(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<DecisionHistoryResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let decisions = state.approvals.decisions(account_id).await?;
    Ok(Json(DecisionHistoryResponse {
        account_id,
        decisions,
    }))
}
