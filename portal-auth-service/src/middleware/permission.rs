use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::models::Permission;
use crate::services::{AccessSubject, ServiceError};
use crate::AppState;

/// Admits the request only if the authenticated subject holds `permission`.
/// Must run inside [`auth_middleware`](super::auth_middleware).
pub async fn require_permission(
    State(state): State<AppState>,
    permission: Permission,
    req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let subject = req.extensions().get::<AccessSubject>().ok_or_else(|| {
        ServiceError::Unauthenticated("Authentication required".to_string())
    })?;

    state.authz.require(subject, &permission)?;

    Ok(next.run(req).await)
}
