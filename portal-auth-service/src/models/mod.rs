pub mod account;
pub mod approval_decision;
pub mod permission;
pub mod refresh_session;
pub mod verification_token;

pub use account::{Account, ApprovalState, Role, SanitizedAccount};
pub use approval_decision::{ApprovalDecision, Decision};
pub use permission::{OverrideEffect, Permission, PermissionCategory, PermissionOverride, CATALOG};
pub use refresh_session::RefreshSession;
pub use verification_token::VerificationToken;
