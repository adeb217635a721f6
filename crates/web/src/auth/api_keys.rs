//! API-key issuance, listing, revocation and request-time authentication.
//!
//! The raw key is handed to the caller once at creation. Only its SHA-256
//! hash is persisted, and lookups go by hash.

use chrono::{DateTime, Duration, Utc};
use projectgate_common::crypto::{generate_token, hash_secret};
use projectgate_common::{retry_transient, ApiKeyRecord, CredentialStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::audit::{emit, AuditEvent, AuditEventType, AuditOutcome, AuditSink};
use super::clock::Clock;
use super::types::Principal;
use crate::error::AuthError;

/// Prefix on every raw key, so leaked keys are recognizable.
pub const API_KEY_PREFIX: &str = "pgk_";
const MAX_NAME_LEN: usize = 100;
const MAX_EXPIRY_DAYS: u32 = 3650;

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

/// Key metadata safe to return from list endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKeyRecord> for ApiKeySummary {
    fn from(r: ApiKeyRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            scopes: r.scopes,
            expires_at: r.expires_at,
            revoked: r.revoked,
            created_at: r.created_at,
        }
    }
}

/// Creation result; `key` is the raw secret and is never shown again.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub summary: ApiKeySummary,
    pub key: String,
}

pub struct ApiKeyService {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ApiKeyService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
        }
    }

    pub async fn create(
        &self,
        owner_id: &str,
        request: CreateApiKeyRequest,
    ) -> Result<CreatedApiKey, AuthError> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(AuthError::Validation(format!(
                "name must be 1 to {MAX_NAME_LEN} characters"
            )));
        }
        if let Some(bad) = request.scopes.iter().find(|s| !is_valid_scope(s)) {
            return Err(AuthError::Validation(format!("invalid scope {bad:?}")));
        }
        let now = self.clock.now();
        let expires_at = match request.expires_in_days {
            Some(days) if days == 0 || days > MAX_EXPIRY_DAYS => {
                return Err(AuthError::Validation(format!(
                    "expiresInDays must be between 1 and {MAX_EXPIRY_DAYS}"
                )));
            }
            Some(days) => Some(now + Duration::days(i64::from(days))),
            None => None,
        };

        let raw = format!("{API_KEY_PREFIX}{}", generate_token(32));
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name,
            key_hash: hash_secret(&raw),
            scopes: request.scopes,
            expires_at,
            revoked: false,
            created_at: now,
        };
        self.store.insert_api_key(&record).await?;

        info!(subject_id = %owner_id, key_id = %record.id, "Created api key");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::ApiKeyCreated,
                Some(owner_id),
                AuditOutcome::Success,
                now,
            )
            .with_meta("keyId", record.id.clone()),
        )
        .await;

        Ok(CreatedApiKey {
            summary: record.into(),
            key: raw,
        })
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<ApiKeySummary>, AuthError> {
        let store = &self.store;
        let keys = retry_transient(move || store.list_api_keys(owner_id)).await?;
        Ok(keys.into_iter().map(ApiKeySummary::from).collect())
    }

    /// Revoke one of the owner's keys. Keys owned by someone else look absent.
    pub async fn revoke(&self, owner_id: &str, key_id: &str) -> Result<(), AuthError> {
        if !self.store.revoke_api_key(owner_id, key_id).await? {
            return Err(AuthError::NotFound {
                kind: "api_key".to_string(),
            });
        }
        info!(subject_id = %owner_id, key_id = %key_id, "Revoked api key");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::ApiKeyRevoked,
                Some(owner_id),
                AuditOutcome::Success,
                self.clock.now(),
            )
            .with_meta("keyId", key_id),
        )
        .await;
        Ok(())
    }

    /// Resolve a presented raw key to a principal acting as the key's owner.
    pub async fn authenticate(&self, raw_key: &str) -> Result<Principal, AuthError> {
        let key_hash = hash_secret(raw_key);
        let store = &self.store;
        let hash = key_hash.as_str();
        let record = retry_transient(move || store.find_api_key_by_hash(hash))
            .await?
            .ok_or(AuthError::InvalidApiKey)?;

        if !record.is_usable_at(self.clock.now()) {
            debug!(key_id = %record.id, revoked = record.revoked, "Rejected unusable api key");
            return Err(AuthError::InvalidApiKey);
        }

        let owner_id = record.owner_id.as_str();
        let owner = retry_transient(move || store.find_user_by_id(owner_id))
            .await?
            .ok_or(AuthError::InvalidApiKey)?;

        Ok(Principal::api_key(
            owner.id,
            owner.roles,
            record.scopes,
            record.id,
        ))
    }
}

/// `*`, or `resource:action` where either side may be `*`.
fn is_valid_scope(scope: &str) -> bool {
    if scope == "*" {
        return true;
    }
    match scope.split_once(':') {
        Some((resource, action)) => {
            let ok = |s: &str| {
                !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '*')
            };
            ok(resource) && ok(action)
        }
        None => false,
    }
}
