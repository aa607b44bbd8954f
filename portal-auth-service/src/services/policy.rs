//! Review policy: the single table deciding, per role, whether self-registration is
//! open, which profile fields registration requires, and whether an admin must review
//! the account after its email is verified.

use std::collections::HashMap;

use crate::dtos::FieldError;
use crate::models::{ApprovalState, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePolicy {
    pub requires_admin_review: bool,
    pub self_registration: bool,
    pub required_profile_fields: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct ReviewPolicy {
    entries: HashMap<Role, RolePolicy>,
}

impl Default for ReviewPolicy {
    /// Patients are the only role activated without review.
    fn default() -> Self {
        Self::with_review_exempt(&[Role::Patient])
    }
}

impl ReviewPolicy {
    /// Default table with `exempt` roles skipping admin review. Admin accounts always
    /// require review and never self-register.
    pub fn with_review_exempt(exempt: &[Role]) -> Self {
        let entries = Role::ALL
            .iter()
            .map(|&role| {
                let policy = RolePolicy {
                    requires_admin_review: role == Role::Admin || !exempt.contains(&role),
                    self_registration: role != Role::Admin,
                    required_profile_fields: required_fields(role),
                };
                (role, policy)
            })
            .collect();
        Self { entries }
    }

    pub fn for_role(&self, role: Role) -> RolePolicy {
        self.entries.get(&role).copied().unwrap_or(RolePolicy {
            requires_admin_review: true,
            self_registration: false,
            required_profile_fields: &[],
        })
    }

    /// State an account of `role` enters once its email is verified.
    pub fn state_after_verification(&self, role: Role) -> ApprovalState {
        if self.for_role(role).requires_admin_review {
            ApprovalState::PendingAdminApproval
        } else {
            ApprovalState::Approved
        }
    }

    /// Roles that skip review, in declaration order.
    pub fn review_exempt_roles(&self) -> Vec<Role> {
        Role::ALL
            .iter()
            .copied()
            .filter(|role| !self.for_role(*role).requires_admin_review)
            .collect()
    }

    /// Field-level problems with a self-registration request.
    pub fn check_registration(&self, role: Role, profile: &serde_json::Value) -> Vec<FieldError> {
        let policy = self.for_role(role);
        if !policy.self_registration {
            return vec![FieldError::new(
                "role",
                format!("{} accounts cannot self-register", role),
            )];
        }

        let Some(fields) = profile.as_object() else {
            return vec![FieldError::new("profile", "must be a JSON object")];
        };

        policy
            .required_profile_fields
            .iter()
            .filter(|field| {
                fields
                    .get(**field)
                    .and_then(|v| v.as_str())
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|field| FieldError::new(&format!("profile.{}", field), "is required"))
            .collect()
    }
}

fn required_fields(role: Role) -> &'static [&'static str] {
    match role {
        Role::Patient => &["full_name", "date_of_birth"],
        Role::Doctor => &["full_name", "license_number", "specialization"],
        Role::Nurse => &["full_name", "license_number"],
        Role::Pharmacist => &["full_name", "license_number"],
        Role::LabTechnician => &["full_name", "certification_number"],
        Role::Staff => &["full_name", "department"],
        Role::ExternalRequester => &["organization_name", "contact_name", "purpose"],
        Role::Admin => &["full_name"],
    }
}
