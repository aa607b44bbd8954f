pub mod registration;
pub mod session;

pub use registration::{register, resend_verification, verify_email};
pub use session::{login, logout, refresh};
