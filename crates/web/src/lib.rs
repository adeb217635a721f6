//! ProjectGate authentication service
//!
//! Token issuance, request authentication and role-based access control
//! behind an axum router.

pub mod auth;
pub mod config;
pub mod error;
pub mod server;

pub use auth::{AuthService, AuthenticationResolver, Policy, PolicyEngine, Principal, Role};
pub use config::{AuthSettings, ConfigError, ValidatedConfig};
pub use error::{ApiError, AuthError};
pub use server::{compose, router, serve, AppState};
