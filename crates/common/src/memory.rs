//! In-memory credential store, used by tests and single-process demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::store::CredentialStore;
use crate::types::{ApiKeyRecord, RefreshSession, SessionState, SessionSwap, UserRecord};

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    /// email -> user id
    emails: HashMap<String, String>,
    api_keys: HashMap<String, ApiKeyRecord>,
    /// key hash -> key id
    key_hashes: HashMap<String, String>,
    sessions: HashMap<String, RefreshSession>,
}

/// Credential store backed by process memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Inner>,
    pending_faults: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` read operations fail with a transient error.
    pub fn inject_transient_faults(&self, count: usize) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    fn take_fault(&self) -> StoreResult<()> {
        let fired = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fired {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.emails.contains_key(&user.email) {
            return Err(StoreError::AlreadyExists {
                kind: "user".to_string(),
                key: user.email.clone(),
            });
        }
        inner.emails.insert(user.email.clone(), user.id.clone());
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        self.take_fault()?;
        let inner = self.inner.lock();
        Ok(inner
            .emails
            .get(email)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn find_user_by_id(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        self.take_fault()?;
        Ok(self.inner.lock().users.get(id).cloned())
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.key_hashes.contains_key(&key.key_hash) {
            return Err(StoreError::AlreadyExists {
                kind: "api_key".to_string(),
                key: key.id.clone(),
            });
        }
        inner.key_hashes.insert(key.key_hash.clone(), key.id.clone());
        inner.api_keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKeyRecord>> {
        self.take_fault()?;
        let inner = self.inner.lock();
        Ok(inner
            .key_hashes
            .get(key_hash)
            .and_then(|id| inner.api_keys.get(id))
            .cloned())
    }

    async fn list_api_keys(&self, owner_id: &str) -> StoreResult<Vec<ApiKeyRecord>> {
        self.take_fault()?;
        let inner = self.inner.lock();
        let mut keys: Vec<ApiKeyRecord> = inner
            .api_keys
            .values()
            .filter(|k| k.owner_id == owner_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn revoke_api_key(&self, owner_id: &str, key_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.api_keys.get_mut(key_id) {
            Some(key) if key.owner_id == owner_id => {
                key.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_refresh_session(&self, session: &RefreshSession) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(StoreError::AlreadyExists {
                kind: "refresh_session".to_string(),
                key: session.session_id.clone(),
            });
        }
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn find_refresh_session(&self, session_id: &str) -> StoreResult<Option<RefreshSession>> {
        self.take_fault()?;
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn upsert_refresh_session(
        &self,
        session_id: &str,
        expected_old_hash: &str,
        new_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<SessionSwap> {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(SessionSwap::Conflict);
        };
        if session.state != SessionState::Active || session.current_hash != expected_old_hash {
            return Ok(SessionSwap::Conflict);
        }
        session.rotated_from = Some(session.generation);
        session.generation += 1;
        session.current_hash = new_hash.to_string();
        session.updated_at = at;
        Ok(SessionSwap::Swapped(session.clone()))
    }

    async fn revoke_session(&self, session_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(session_id) {
            Some(session) if session.state != SessionState::Revoked => {
                session.state = SessionState::Revoked;
                session.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn session(id: &str, hash: &str) -> RefreshSession {
        let now = Utc::now();
        RefreshSession {
            session_id: id.to_string(),
            subject_id: "u1".to_string(),
            current_hash: hash.to_string(),
            generation: 0,
            rotated_from: None,
            state: SessionState::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(14),
        }
    }

    #[tokio::test]
    async fn test_swap_requires_matching_hash() {
        let store = MemoryCredentialStore::new();
        store.create_refresh_session(&session("s1", "h0")).await.unwrap();

        let swapped = store
            .upsert_refresh_session("s1", "h0", "h1", Utc::now())
            .await
            .unwrap();
        match swapped {
            SessionSwap::Swapped(s) => {
                assert_eq!(s.current_hash, "h1");
                assert_eq!(s.generation, 1);
                assert_eq!(s.rotated_from, Some(0));
            }
            SessionSwap::Conflict => panic!("expected swap"),
        }

        // Stale hash loses.
        let stale = store
            .upsert_refresh_session("s1", "h0", "h2", Utc::now())
            .await
            .unwrap();
        assert_eq!(stale, SessionSwap::Conflict);
    }

    #[tokio::test]
    async fn test_revoked_session_never_swaps() {
        let store = MemoryCredentialStore::new();
        store.create_refresh_session(&session("s1", "h0")).await.unwrap();
        assert!(store.revoke_session("s1", Utc::now()).await.unwrap());
        assert!(!store.revoke_session("s1", Utc::now()).await.unwrap());

        let outcome = store
            .upsert_refresh_session("s1", "h0", "h1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, SessionSwap::Conflict);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = MemoryCredentialStore::new();
        let user = UserRecord {
            id: "u1".to_string(),
            email: "a@example.com".to_string(),
            password_hash: "x".to_string(),
            roles: BTreeSet::new(),
            created_at: Utc::now(),
        };
        store.insert_user(&user).await.unwrap();
        let dup = UserRecord {
            id: "u2".to_string(),
            ..user
        };
        assert!(matches!(
            store.insert_user(&dup).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryCredentialStore::new();
        store.inject_transient_faults(1);
        assert!(store.find_user_by_id("nobody").await.is_err());
        assert!(store.find_user_by_id("nobody").await.unwrap().is_none());
    }
}
