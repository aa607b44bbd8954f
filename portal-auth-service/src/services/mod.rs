//! Services layer for the portal auth service.
//!
//! The provisioning core (credential store, verification and approval coordinators,
//! permission matrix, authorization engine, session issuer) plus the infrastructure it
//! talks to: session cache, email delivery and metrics.

pub mod accounts;
pub mod approval;
pub mod authorization;
pub mod cache;
pub mod email;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod permission_matrix;
pub mod policy;
pub mod session;
pub mod store;
pub mod verification;

pub use accounts::AccountService;
pub use approval::{ApprovalCoordinator, DecisionOutcome};
pub use authorization::{AccessSubject, AuthorizationEngine};
pub use cache::{MockSessionCache, RedisService, SessionCache};
pub use email::{EmailProvider, EmailService, LogOnlyEmailService, MockEmailService, SentEmail};
pub use error::ServiceError;
pub use jwt::{AccessTokenClaims, JwtService, RefreshTokenClaims, TokenResponse};
pub use permission_matrix::{MatrixSnapshot, PermissionMatrix};
pub use policy::ReviewPolicy;
pub use session::SessionIssuer;
pub use store::{CredentialStore, InMemoryCredentialStore, PgCredentialStore, StoreError};
pub use verification::{VerificationCoordinator, Verified};
