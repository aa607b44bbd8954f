use axum::{
    extract::{rejection::PathRejection, Path, State},
    Json,
};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::account_id;
use crate::{
    dtos::{
        admin::{
            PermissionOverridesRequest, PermissionOverridesResponse, RevokeSessionsResponse,
            RolePermissionsResponse, SetRolePermissionsRequest,
        },
        ErrorResponse,
    },
    middleware::AuthUser,
    models::PermissionOverride,
    services::{MatrixSnapshot, ServiceError},
    AppState,
};

fn overrides_response(
    account_id: Uuid,
    overrides: &[PermissionOverride],
) -> Json<PermissionOverridesResponse> {
    Json(PermissionOverridesResponse {
        account_id,
        overrides: overrides
            .iter()
            .map(|o| (o.permission.to_string(), o.effect))
            .collect(),
    })
}

fn matrix_response(snapshot: &MatrixSnapshot) -> Json<RolePermissionsResponse> {
    Json(RolePermissionsResponse {
        version: snapshot.version(),
        roles: snapshot
            .roles()
            .into_iter()
            .map(|(role, perms)| (role, perms.iter().map(|p| p.to_string()).collect()))
            .collect::<BTreeMap<_, _>>(),
    })
}

/// Revoke every session of an account
#[utoipa::path(
    post,
    path = "/admin/accounts/{account_id}/revoke-sessions",
    params(("account_id" = Uuid, Path, description = "Account")),
    responses(
        (status = 200, description = "Sessions revoked", body = RevokeSessionsResponse),
        (status = 403, description = "Missing system.revoke_sessions", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn revoke_sessions(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<RevokeSessionsResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let session_epoch = state.sessions.revoke(account_id).await?;
    tracing::info!(account_id = %account_id, revoked_by = %admin.account_id, "Sessions revoked by admin");
    Ok(Json(RevokeSessionsResponse {
        account_id,
        session_epoch,
    }))
}

/// Per-account permission overrides
#[utoipa::path(
    get,
    path = "/admin/accounts/{account_id}/permission-overrides",
    params(("account_id" = Uuid, Path, description = "Account")),
    responses(
        (status = 200, description = "Current overrides", body = PermissionOverridesResponse),
        (status = 404, description = "Account not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_permission_overrides(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<PermissionOverridesResponse>, ServiceError> {
    let account_id = account_id(path)?;
    let overrides = state.authz.overrides(account_id).await?;
    Ok(overrides_response(account_id, &overrides))
}

/// Replace an account's permission overrides
#[utoipa::path(
    put,
    path = "/admin/accounts/{account_id}/permission-overrides",
    params(("account_id" = Uuid, Path, description = "Account")),
    request_body = PermissionOverridesRequest,
    responses(
        (status = 200, description = "Overrides replaced", body = PermissionOverridesResponse),
        (status = 400, description = "Unknown permission id", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn put_permission_overrides(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    Json(req): Json<PermissionOverridesRequest>,
) -> Result<Json<PermissionOverridesResponse>, ServiceError> {
    let account_id = account_id(path)?;
    if state.store.find_account(account_id).await?.is_none() {
        return Err(ServiceError::AccountNotFound);
    }
    let overrides = state
        .authz
        .set_overrides(account_id, &req.overrides, admin.account_id)
        .await?;
    Ok(overrides_response(account_id, &overrides))
}

/// Current role to permission matrix
#[utoipa::path(
    get,
    path = "/admin/role-permissions",
    responses(
        (status = 200, description = "Matrix snapshot", body = RolePermissionsResponse),
        (status = 403, description = "Missing system.manage_permissions", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn get_role_permissions(State(state): State<AppState>) -> Json<RolePermissionsResponse> {
    matrix_response(&state.authz.matrix().snapshot())
}

/// Replace one role's permission set
///
/// Persists a new matrix version and swaps the in-memory snapshot atomically.
#[utoipa::path(
    post,
    path = "/admin/role-permissions",
    request_body = SetRolePermissionsRequest,
    responses(
        (status = 200, description = "New matrix snapshot", body = RolePermissionsResponse),
        (status = 400, description = "Unknown permission or admin role", body = ErrorResponse),
        (status = 409, description = "Concurrent matrix update", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn set_role_permissions(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    Json(req): Json<SetRolePermissionsRequest>,
) -> Result<Json<RolePermissionsResponse>, ServiceError> {
    let snapshot = state
        .authz
        .matrix()
        .set_role_permissions(req.role, &req.permissions, Some(admin.account_id))
        .await?;
    Ok(matrix_response(&snapshot))
}
