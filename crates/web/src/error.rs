//! Auth error taxonomy and its HTTP rendering.
//!
//! Every auth operation returns `Result<T, AuthError>`. [`ApiError`] is the
//! only place error kinds become status codes and the JSON envelope.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use projectgate_common::StoreError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::password::PasswordError;
use crate::auth::tokens::{SigningError, VerificationFailure};
use crate::auth::types::RequestId;

/// Why a request failed authentication. Only the expired/invalid split is
/// ever surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthenticatedReason {
    Missing,
    Expired,
    Invalid,
}

impl From<VerificationFailure> for UnauthenticatedReason {
    fn from(f: VerificationFailure) -> Self {
        match f {
            VerificationFailure::Expired => UnauthenticatedReason::Expired,
            VerificationFailure::Malformed | VerificationFailure::WrongClass => {
                UnauthenticatedReason::Invalid
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated ({0:?})")]
    Unauthenticated(UnauthenticatedReason),

    #[error("missing permission {permission}")]
    Forbidden { permission: String },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("rate limited until {reset_at}")]
    RateLimited {
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    #[error("refresh token reuse detected")]
    TokenReuseDetected,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} already exists")]
    Conflict { kind: String },

    #[error("{kind} not found")]
    NotFound { kind: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated(_) => "UNAUTHENTICATED",
            AuthError::Forbidden { .. } => "FORBIDDEN",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::InvalidApiKey => "INVALID_API_KEY",
            AuthError::RateLimited { .. } => "RATE_LIMITED",
            AuthError::TokenReuseDetected => "TOKEN_REUSE_DETECTED",
            AuthError::Validation(_) => "VALIDATION_FAILED",
            AuthError::Conflict { .. } => "CONFLICT",
            AuthError::NotFound { .. } => "NOT_FOUND",
            AuthError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthenticated(_)
            | AuthError::InvalidCredentials
            | AuthError::InvalidApiKey
            | AuthError::TokenReuseDetected => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Conflict { .. } => StatusCode::CONFLICT,
            AuthError::NotFound { .. } => StatusCode::NOT_FOUND,
            AuthError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated(_) => "Authentication required",
            AuthError::Forbidden { .. } => "Forbidden",
            AuthError::InvalidCredentials => "Invalid credentials",
            AuthError::InvalidApiKey => "Invalid API key",
            AuthError::RateLimited { .. } => "Too many attempts",
            AuthError::TokenReuseDetected => "Session revoked",
            AuthError::Validation(_) => "Validation failed",
            AuthError::Conflict { .. } => "Conflict",
            AuthError::NotFound { .. } => "Not found",
            AuthError::ServiceUnavailable(_) => "Service unavailable",
            AuthError::Internal(_) => "Internal error",
        }
    }

    /// Client-facing detail. Authentication failures stay generic; store
    /// and internal failures never leak their cause.
    pub fn detail(&self) -> String {
        match self {
            AuthError::Unauthenticated(UnauthenticatedReason::Expired) => {
                "Credentials expired".to_string()
            }
            AuthError::Unauthenticated(UnauthenticatedReason::Missing) => {
                "Credentials required".to_string()
            }
            AuthError::Unauthenticated(UnauthenticatedReason::Invalid) => {
                "Credentials invalid".to_string()
            }
            AuthError::Forbidden { permission } => format!("Missing permission {permission}"),
            AuthError::InvalidCredentials => "Email or password is incorrect".to_string(),
            AuthError::InvalidApiKey => "API key is invalid, revoked or expired".to_string(),
            AuthError::RateLimited { retry_after_secs, .. } => {
                format!("Too many attempts, retry in {retry_after_secs}s")
            }
            AuthError::TokenReuseDetected => {
                "Refresh token reuse detected; session revoked".to_string()
            }
            AuthError::Validation(msg) => msg.clone(),
            AuthError::Conflict { kind } => format!("{kind} already exists"),
            AuthError::NotFound { kind } => format!("{kind} not found"),
            AuthError::ServiceUnavailable(_) => "Try again later".to_string(),
            AuthError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Attach the request id for rendering.
    pub fn for_request(self, request_id: &RequestId) -> ApiError {
        ApiError {
            error: self,
            request_id: request_id.clone(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists { kind, .. } => AuthError::Conflict { kind },
            other => AuthError::ServiceUnavailable(other.to_string()),
        }
    }
}

impl From<VerificationFailure> for AuthError {
    fn from(f: VerificationFailure) -> Self {
        AuthError::Unauthenticated(f.into())
    }
}

impl From<SigningError> for AuthError {
    fn from(e: SigningError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

impl From<PasswordError> for AuthError {
    fn from(e: PasswordError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(e: tokio::task::JoinError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

/// An [`AuthError`] bound to the request it failed.
#[derive(Debug)]
pub struct ApiError {
    pub error: AuthError,
    pub request_id: RequestId,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if status.is_server_error() {
            error!(request_id = %self.request_id, error = %self.error, "Request failed");
        }

        let mut meta = json!({ "requestId": self.request_id.0 });
        if let AuthError::RateLimited { reset_at, .. } = &self.error {
            meta["resetAt"] = json!(reset_at.to_rfc3339());
        }
        let body = Json(json!({
            "errors": [{
                "code": self.error.code(),
                "title": self.error.title(),
                "detail": self.error.detail(),
            }],
            "meta": meta,
        }));

        let mut response = (status, body).into_response();
        if let AuthError::RateLimited { retry_after_secs, .. } = &self.error {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
