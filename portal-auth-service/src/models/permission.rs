//! Permission identifiers and the catalog they are drawn from.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    User,
    Patient,
    MedicalRecord,
    Appointment,
    Prescription,
    Lab,
    System,
}

impl PermissionCategory {
    pub fn prefix(&self) -> &'static str {
        match self {
            PermissionCategory::User => "user",
            PermissionCategory::Patient => "patient",
            PermissionCategory::MedicalRecord => "medical_record",
            PermissionCategory::Appointment => "appointment",
            PermissionCategory::Prescription => "prescription",
            PermissionCategory::Lab => "lab",
            PermissionCategory::System => "system",
        }
    }
}

/// Every known permission id, grouped by category. An id lives in exactly one category
/// and carries that category's prefix.
pub const CATALOG: &[(PermissionCategory, &[&str])] = &[
    (
        PermissionCategory::User,
        &["user.read", "user.create", "user.update", "user.delete"],
    ),
    (
        PermissionCategory::Patient,
        &["patient.read", "patient.create", "patient.update", "patient.delete"],
    ),
    (
        PermissionCategory::MedicalRecord,
        &[
            "medical_record.read",
            "medical_record.create",
            "medical_record.update",
            "medical_record.request",
        ],
    ),
    (
        PermissionCategory::Appointment,
        &[
            "appointment.read",
            "appointment.create",
            "appointment.update",
            "appointment.cancel",
        ],
    ),
    (
        PermissionCategory::Prescription,
        &["prescription.read", "prescription.create", "prescription.dispense"],
    ),
    (PermissionCategory::Lab, &["lab.read", "lab.create", "lab.update"]),
    (
        PermissionCategory::System,
        &[
            "system.settings",
            "system.audit",
            "system.approve_accounts",
            "system.manage_permissions",
            "system.revoke_sessions",
        ],
    ),
];

/// A catalog-validated permission id such as `lab.create`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const APPROVE_ACCOUNTS: Permission = Permission(Cow::Borrowed("system.approve_accounts"));
    pub const MANAGE_PERMISSIONS: Permission =
        Permission(Cow::Borrowed("system.manage_permissions"));
    pub const REVOKE_SESSIONS: Permission = Permission(Cow::Borrowed("system.revoke_sessions"));

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> Option<PermissionCategory> {
        CATALOG
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| *id == self.as_str()))
            .map(|(category, _)| *category)
    }

    /// Every permission in the catalog.
    pub fn all() -> impl Iterator<Item = Permission> {
        CATALOG
            .iter()
            .flat_map(|(_, ids)| ids.iter())
            .map(|id| Permission(Cow::Borrowed(*id)))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Permission {
    type Err = String;

    /// Accepts only ids present in the catalog.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CATALOG
            .iter()
            .flat_map(|(_, ids)| ids.iter())
            .find(|id| **id == s)
            .map(|id| Permission(Cow::Borrowed(*id)))
            .ok_or_else(|| s.to_string())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|id| serde::de::Error::custom(format!("unknown permission: {}", id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OverrideEffect {
    Grant,
    Deny,
}

impl OverrideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideEffect::Grant => "grant",
            OverrideEffect::Deny => "deny",
        }
    }
}

impl FromStr for OverrideEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(OverrideEffect::Grant),
            "deny" => Ok(OverrideEffect::Deny),
            _ => Err(format!("Unknown override effect: {}", s)),
        }
    }
}

/// Per-account exception to the role's permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub account_id: Uuid,
    pub permission: Permission,
    pub effect: OverrideEffect,
}
