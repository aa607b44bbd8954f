use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{ApprovalState, Role, SanitizedAccount};

fn empty_profile() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 254, message = "Login must be 3 to 254 characters"))]
    #[schema(example = "dr.house")]
    pub login: String,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "house@example-hospital.org")]
    pub email: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    #[schema(example = "CorrectHorse42!", min_length = 8)]
    pub password: String,

    pub role: Role,

    /// Role-specific attributes, e.g. `license_number` for clinical staff.
    #[serde(default = "empty_profile")]
    #[schema(value_type = Object)]
    pub profile: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub account_id: Uuid,
    pub approval_state: ApprovalState,
}

#[derive(Debug, Deserialize, Validate, ToSchema, IntoParams)]
pub struct VerifyEmailQuery {
    #[validate(length(min = 1, message = "Token is required"))]
    #[param(example = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyEmailResponse {
    pub account_id: Uuid,
    pub approval_state: ApprovalState,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ResendVerificationRequest {
    #[validate(length(min = 1, message = "Login is required"))]
    #[schema(example = "dr.house")]
    pub login: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Login is required"))]
    #[schema(example = "dr.house")]
    pub login: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "CorrectHorse42!")]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    #[schema(min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub account: SanitizedAccount,
    /// Role snapshot carried by the presented access token.
    pub token_role: Role,
    #[schema(example = json!(["patient.read", "appointment.create"]))]
    pub permissions: Vec<String>,
}
