//! Core types for the authentication system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for an authenticated subject
pub type SubjectId = String;

/// How a principal proved its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMethod {
    Bearer,
    ApiKey,
}

/// Token class embedded in every signed token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenClass {
    Access,
    Refresh,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenClass::Access => "access",
            TokenClass::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated identity attached to a request.
///
/// Built per request by the resolver and dropped with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: SubjectId,
    pub roles: BTreeSet<String>,
    pub auth_method: AuthMethod,
    /// API-key scopes; empty for bearer principals
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub scopes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
}

impl Principal {
    pub fn bearer(id: impl Into<String>, roles: BTreeSet<String>, session_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            roles,
            auth_method: AuthMethod::Bearer,
            scopes: BTreeSet::new(),
            session_id,
            api_key_id: None,
        }
    }

    pub fn api_key(
        id: impl Into<String>,
        roles: BTreeSet<String>,
        scopes: BTreeSet<String>,
        api_key_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            roles,
            auth_method: AuthMethod::ApiKey,
            scopes,
            session_id: None,
            api_key_id: Some(api_key_id.into()),
        }
    }
}

/// Access and refresh token pair returned by login and refresh.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub token_type: &'static str,
    #[serde(skip)]
    pub session_id: String,
    #[serde(skip)]
    pub subject_id: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("session_id", &self.session_id)
            .field("subject_id", &self.subject_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Login request body
#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Refresh / logout request body
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// User registration body
#[derive(Clone, Deserialize)]
pub struct RegistrationRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// Correlation id for one inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request-scoped context handed to protected handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub principal: Principal,
}
