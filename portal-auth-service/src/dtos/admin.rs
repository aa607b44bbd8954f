use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{ApprovalDecision, ApprovalState, OverrideEffect, Role, SanitizedAccount};

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct DecisionRequest {
    #[validate(length(max = 2000, message = "Notes must be at most 2000 characters"))]
    #[schema(example = "License verified against the state registry")]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecisionResponse {
    pub account_id: Uuid,
    pub approval_state: ApprovalState,
    pub decision: ApprovalDecision,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PendingAccountsResponse {
    pub accounts: Vec<SanitizedAccount>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecisionHistoryResponse {
    pub account_id: Uuid,
    pub decisions: Vec<ApprovalDecision>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevokeSessionsResponse {
    pub account_id: Uuid,
    pub session_epoch: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionOverridesRequest {
    /// Permission id to effect. Replaces the account's whole override set.
    #[schema(value_type = Object, example = json!({"prescription.write": "deny"}))]
    pub overrides: BTreeMap<String, OverrideEffect>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionOverridesResponse {
    pub account_id: Uuid,
    #[schema(value_type = Object)]
    pub overrides: BTreeMap<String, OverrideEffect>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RolePermissionsResponse {
    pub version: i64,
    /// Every role including admin, whose set is the whole catalog.
    #[schema(value_type = Object)]
    pub roles: BTreeMap<Role, Vec<String>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetRolePermissionsRequest {
    pub role: Role,
    #[schema(example = json!(["patient.read", "medical_record.read"]))]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BootstrapAdminRequest {
    #[validate(length(min = 3, max = 254, message = "Login must be 3 to 254 characters"))]
    #[schema(example = "root.admin")]
    pub login: String,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "it-admin@example-hospital.org")]
    pub email: String,

    #[validate(length(min = 12, max = 128, message = "Password must be 12 to 128 characters"))]
    #[schema(min_length = 12)]
    pub password: String,

    #[validate(length(min = 1, message = "Full name is required"))]
    #[schema(example = "Hospital IT")]
    pub full_name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BootstrapAdminResponse {
    pub account_id: Uuid,
    pub approval_state: ApprovalState,
}
