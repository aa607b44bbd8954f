use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{
    dtos::{
        admin::{BootstrapAdminRequest, BootstrapAdminResponse},
        ErrorResponse,
    },
    services::ServiceError,
    utils::ValidatedJson,
    AppState,
};

/// Create the first administrator
///
/// Guarded by `X-Admin-Api-Key`. Refused with 409 once an admin account exists.
#[utoipa::path(
    post,
    path = "/admin/bootstrap",
    request_body = BootstrapAdminRequest,
    responses(
        (status = 201, description = "Administrator created", body = BootstrapAdminResponse),
        (status = 401, description = "Missing or wrong API key", body = ErrorResponse),
        (status = 409, description = "An administrator already exists", body = ErrorResponse)
    ),
    security(("admin_api_key" = [])),
    tag = "Admin"
)]
pub async fn bootstrap_admin(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<BootstrapAdminRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let res = state.accounts.bootstrap_admin(req).await?;
    Ok((StatusCode::CREATED, Json(res)))
}
