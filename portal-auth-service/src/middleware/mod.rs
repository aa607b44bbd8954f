pub mod admin;
pub mod auth;
pub mod metrics;
pub mod permission;

pub use admin::{admin_auth_middleware, ADMIN_API_KEY_HEADER};
pub use auth::{auth_middleware, AuthUser};
pub use metrics::metrics_middleware;
pub use permission::require_permission;
