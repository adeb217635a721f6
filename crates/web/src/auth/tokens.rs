//! Signed, time-bound access and refresh tokens.
//!
//! Tokens are HS256 JWTs. Signing always uses the active secret of the
//! class's ring; verification tries the active secret and then each
//! fallback in order, so tokens minted before a rotation stay valid until
//! they expire.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::clock::Clock;
use super::secrets::SecretRing;
use super::types::TokenClass;

/// Why a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("token expired")]
    Expired,
    #[error("token malformed or signature invalid")]
    Malformed,
    #[error("token class mismatch")]
    WrongClass,
}

#[derive(Debug, Error)]
#[error("token signing failed: {0}")]
pub struct SigningError(#[from] jsonwebtoken::errors::Error);

/// Wire claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    typ: TokenClass,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
}

/// A freshly minted token. `token` is a credential and must not be logged.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Claims recovered from a token that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject_id: String,
    pub roles: BTreeSet<String>,
    pub session_id: Option<String>,
    pub class: TokenClass,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenService {
    access: SecretRing,
    refresh: SecretRing,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(
        access: SecretRing,
        refresh: SecretRing,
        access_ttl: Duration,
        refresh_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access,
            refresh,
            access_ttl,
            refresh_ttl,
            clock,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    fn ring(&self, class: TokenClass) -> &SecretRing {
        match class {
            TokenClass::Access => &self.access,
            TokenClass::Refresh => &self.refresh,
        }
    }

    /// Mint an access token carrying the subject's roles at issue time.
    /// `session_id` links the token to the refresh session it came from.
    pub fn issue_access_token(
        &self,
        subject_id: &str,
        roles: &BTreeSet<String>,
        session_id: Option<&str>,
    ) -> Result<IssuedToken, SigningError> {
        self.issue(
            TokenClass::Access,
            subject_id,
            roles.iter().cloned().collect(),
            session_id.map(str::to_string),
        )
    }

    pub fn issue_refresh_token(
        &self,
        subject_id: &str,
        session_id: &str,
    ) -> Result<IssuedToken, SigningError> {
        self.issue(
            TokenClass::Refresh,
            subject_id,
            Vec::new(),
            Some(session_id.to_string()),
        )
    }

    fn issue(
        &self,
        class: TokenClass,
        subject_id: &str,
        roles: Vec<String>,
        sid: Option<String>,
    ) -> Result<IssuedToken, SigningError> {
        let ttl = match class {
            TokenClass::Access => self.access_ttl,
            TokenClass::Refresh => self.refresh_ttl,
        };
        // Claims have second precision; keep the returned instants consistent with them.
        let iat = self.clock.now().timestamp();
        let exp = iat + ttl.num_seconds();
        let claims = Claims {
            sub: subject_id.to_string(),
            typ: class,
            iat,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
            roles,
            sid,
        };

        let key = EncodingKey::from_secret(self.ring(class).active().as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key)?;

        debug!(token_class = %class, subject_id = %subject_id, "Issued token");
        Ok(IssuedToken {
            token,
            issued_at: DateTime::from_timestamp(iat, 0).unwrap_or_default(),
            expires_at: DateTime::from_timestamp(exp, 0).unwrap_or_default(),
        })
    }

    /// Verify a token of the expected class.
    pub fn verify(
        &self,
        token: &str,
        expected: TokenClass,
    ) -> Result<VerifiedToken, VerificationFailure> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock below.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let mut claims = None;
        for secret in self.ring(expected).verification_order() {
            let key = DecodingKey::from_secret(secret.as_bytes());
            match decode::<Claims>(token, &key, &validation) {
                Ok(data) => {
                    claims = Some(data.claims);
                    break;
                }
                Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => continue,
                Err(e) => {
                    debug!(token_class = %expected, error = %e, "Rejected undecodable token");
                    return Err(VerificationFailure::Malformed);
                }
            }
        }
        let claims = claims.ok_or(VerificationFailure::Malformed)?;

        if claims.typ != expected {
            return Err(VerificationFailure::WrongClass);
        }
        if self.clock.now().timestamp() > claims.exp {
            return Err(VerificationFailure::Expired);
        }

        let expires_at =
            DateTime::from_timestamp(claims.exp, 0).ok_or(VerificationFailure::Malformed)?;
        Ok(VerifiedToken {
            subject_id: claims.sub,
            roles: claims.roles.into_iter().collect(),
            session_id: claims.sid,
            class: claims.typ,
            expires_at,
        })
    }
}
