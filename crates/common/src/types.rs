//! Persisted credential records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A user account as seen by the authentication core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    /// Normalized (trimmed, lowercased) email address
    pub email: String,
    /// PHC-format password hash; never the plaintext
    pub password_hash: String,
    pub roles: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted API key. Only the SHA-256 hash of the raw key is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub key_hash: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// A key is usable while it is not revoked and `now` is before its expiry.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// Lifecycle state of a refresh session record.
///
/// Rotation is not a stored state: a successful rotation bumps the
/// generation and leaves the record `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Active,
    Revoked,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "ACTIVE",
            SessionState::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SessionState::Active),
            "REVOKED" => Some(SessionState::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side record of a refresh-token session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSession {
    pub session_id: String,
    pub subject_id: String,
    /// Hash of the only refresh token currently accepted for this session
    pub current_hash: String,
    /// Incremented on every rotation; 0 for the token minted at login
    pub generation: i64,
    /// Generation this record was rotated from, if any
    pub rotated_from: Option<i64>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshSession {
    pub fn is_revoked(&self) -> bool {
        self.state == SessionState::Revoked
    }
}

/// Outcome of a compare-and-swap on a refresh session's token hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSwap {
    /// The expected hash matched; the record now holds the new hash.
    Swapped(RefreshSession),
    /// The record was missing, revoked, or held a different hash.
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(expires_at: Option<DateTime<Utc>>, revoked: bool) -> ApiKeyRecord {
        ApiKeyRecord {
            id: "k1".to_string(),
            owner_id: "u1".to_string(),
            name: "ci".to_string(),
            key_hash: "h".to_string(),
            scopes: BTreeSet::new(),
            expires_at,
            revoked,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_api_key_usability() {
        let now = Utc::now();
        assert!(key(None, false).is_usable_at(now));
        assert!(key(Some(now + Duration::seconds(1)), false).is_usable_at(now));
        assert!(!key(Some(now), false).is_usable_at(now));
        assert!(!key(None, true).is_usable_at(now));
    }

    #[test]
    fn test_session_state_round_trips_through_text() {
        for state in [SessionState::Active, SessionState::Revoked] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse("ROTATED"), None);
    }
}
