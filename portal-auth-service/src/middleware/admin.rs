use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::services::ServiceError;
use crate::AppState;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

/// Guards operator endpoints with the static `X-Admin-Api-Key`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let presented = request
        .headers()
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(key) if keys_match(key, &state.config.security.admin_api_key) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!(path = %request.uri().path(), "Failed admin API key authentication");
            Err(ServiceError::Unauthenticated(
                "Invalid or missing admin API key".to_string(),
            ))
        }
    }
}

/// Length-independent comparison over the whole key.
fn keys_match(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::keys_match;

    #[test]
    fn test_only_the_exact_key_matches() {
        assert!(keys_match("secret-key", "secret-key"));
        assert!(!keys_match("secret-ke", "secret-key"));
        assert!(!keys_match("secret-key!", "secret-key"));
        assert!(!keys_match("", ""));
    }
}
