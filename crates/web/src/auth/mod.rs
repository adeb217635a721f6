//! Authentication and access control.
//!
//! - Signed access/refresh tokens with rotating secret rings
//! - API keys, stored by hash
//! - Fixed-window login throttling
//! - Role-based permission checks
//!
//! Everything is built once at startup (see [`crate::server::compose`]) and
//! shared read-only across requests.

pub mod api_keys;
pub mod audit;
pub mod clock;
pub mod middleware;
pub mod password;
pub mod rate_limit;
pub mod rbac;
pub mod secrets;
pub mod service;
pub mod tokens;
pub mod types;

pub use api_keys::{ApiKeyService, CreateApiKeyRequest, CreatedApiKey};
pub use audit::{AuditEvent, AuditEventType, AuditOutcome, AuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use middleware::AuthenticationResolver;
pub use rate_limit::{FixedWindowLimiter, RateKeyMode, RateLimitConfig};
pub use rbac::{Policy, PolicyEngine, Role};
pub use secrets::{Secret, SecretRing};
pub use service::{AuthService, AuthServiceParts};
pub use tokens::{TokenService, VerificationFailure};
pub use types::*;
