use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

use crate::services::{AccessSubject, ServiceError};
use crate::AppState;

/// Resolves the bearer token into an [`AccessSubject`] request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ServiceError::Unauthenticated("Missing or invalid Authorization header".to_string())
        })?;

    let subject = state.sessions.authenticate(token).await?;
    req.extensions_mut().insert(subject);

    Ok(next.run(req).await)
}

/// The authenticated caller, as placed by [`auth_middleware`].
pub struct AuthUser(pub AccessSubject);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AccessSubject>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| ServiceError::Unauthenticated("Authentication required".to_string()))
    }
}
