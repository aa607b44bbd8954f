//! Account model - a registered identity and its onboarding state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Closed set of account classes. Only the permission matrix and the review policy
/// table branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Nurse,
    Pharmacist,
    LabTechnician,
    Staff,
    Admin,
    ExternalRequester,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Patient,
        Role::Doctor,
        Role::Nurse,
        Role::Pharmacist,
        Role::LabTechnician,
        Role::Staff,
        Role::Admin,
        Role::ExternalRequester,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Pharmacist => "pharmacist",
            Role::LabTechnician => "lab_technician",
            Role::Staff => "staff",
            Role::Admin => "admin",
            Role::ExternalRequester => "external_requester",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("Unknown role: {}", s))
    }
}

/// Position of an account in the onboarding workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    PendingEmailVerification,
    PendingAdminApproval,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::PendingEmailVerification => "pending_email_verification",
            ApprovalState::PendingAdminApproval => "pending_admin_approval",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    /// Approved and rejected accounts no longer wait on a review.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApprovalState::Approved | ApprovalState::Rejected)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_email_verification" => Ok(ApprovalState::PendingEmailVerification),
            "pending_admin_approval" => Ok(ApprovalState::PendingAdminApproval),
            "approved" => Ok(ApprovalState::Approved),
            "rejected" => Ok(ApprovalState::Rejected),
            _ => Err(format!("Unknown approval state: {}", s)),
        }
    }
}

/// Account entity.
#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: Uuid,
    pub login: String,
    pub email: String,
    pub secret_hash: String,
    pub role: Role,
    pub profile: serde_json::Value,
    pub email_verified: bool,
    pub approval_state: ApprovalState,
    /// Bumped on every session revocation; tokens minted under an older epoch are dead.
    pub session_epoch: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub last_login_utc: Option<DateTime<Utc>>,
}

impl Account {
    /// Create a freshly registered account awaiting email verification.
    pub fn new(
        login: String,
        email: String,
        secret_hash: String,
        role: Role,
        profile: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            account_id: Uuid::new_v4(),
            login,
            email,
            secret_hash,
            role,
            profile,
            email_verified: false,
            approval_state: ApprovalState::PendingEmailVerification,
            session_epoch: 0,
            created_utc: now,
            updated_utc: now,
            last_login_utc: None,
        }
    }

    /// Email proven and review passed; the only state sessions may be issued in.
    pub fn is_provisioned(&self) -> bool {
        self.email_verified && self.approval_state == ApprovalState::Approved
    }

    pub fn sanitized(&self) -> SanitizedAccount {
        SanitizedAccount::from(self)
    }
}

/// Account as returned over the API (no secret hash).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SanitizedAccount {
    pub account_id: Uuid,
    pub login: String,
    pub email: String,
    pub role: Role,
    #[schema(value_type = Object)]
    pub profile: serde_json::Value,
    pub email_verified: bool,
    pub approval_state: ApprovalState,
    pub created_utc: DateTime<Utc>,
    pub last_login_utc: Option<DateTime<Utc>>,
}

impl From<&Account> for SanitizedAccount {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.account_id,
            login: account.login.clone(),
            email: account.email.clone(),
            role: account.role,
            profile: account.profile.clone(),
            email_verified: account.email_verified,
            approval_state: account.approval_state,
            created_utc: account.created_utc,
            last_login_utc: account.last_login_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_codes_round_trip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("surgeon".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serializes_as_snake_case() {
        let json = serde_json::to_string(&Role::LabTechnician).unwrap();
        assert_eq!(json, "\"lab_technician\"");
    }

    #[test]
    fn test_new_account_awaits_verification() {
        let account = Account::new(
            "dr.house".into(),
            "house@example.org".into(),
            "hash".into(),
            Role::Doctor,
            serde_json::json!({}),
        );
        assert_eq!(account.approval_state, ApprovalState::PendingEmailVerification);
        assert!(!account.email_verified);
        assert!(!account.is_provisioned());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ApprovalState::Approved.is_terminal());
        assert!(ApprovalState::Rejected.is_terminal());
        assert!(!ApprovalState::PendingAdminApproval.is_terminal());
        assert!(!ApprovalState::PendingEmailVerification.is_terminal());
    }
}
