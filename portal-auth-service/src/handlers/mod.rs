//! HTTP handlers for the portal auth service.

pub mod admin;
pub mod auth;
pub mod me;
pub mod metrics;
