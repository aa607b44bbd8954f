use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            _ => Err(format!("Unknown decision: {}", s)),
        }
    }
}

/// Append-only record of an admin review outcome.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApprovalDecision {
    pub decision_id: Uuid,
    pub account_id: Uuid,
    pub decision: Decision,
    pub reviewer_id: Uuid,
    pub notes: Option<String>,
    pub decided_utc: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn new(account_id: Uuid, decision: Decision, reviewer_id: Uuid, notes: Option<String>) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            account_id,
            decision,
            reviewer_id,
            notes,
            decided_utc: Utc::now(),
        }
    }
}
