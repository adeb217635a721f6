//! Credential store adapter.
//!
//! The authentication core treats persistence as an opaque keyed repository.
//! Backends: [`crate::Database`] (SQLite) and [`crate::MemoryCredentialStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::debug;

use crate::error::StoreResult;
use crate::types::{ApiKeyRecord, RefreshSession, SessionSwap, UserRecord};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a new user. Fails with `AlreadyExists` on a duplicate email.
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;

    async fn find_user_by_id(&self, id: &str) -> StoreResult<Option<UserRecord>>;

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> StoreResult<()>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKeyRecord>>;

    async fn list_api_keys(&self, owner_id: &str) -> StoreResult<Vec<ApiKeyRecord>>;

    /// Mark a key revoked. Returns false when no key with that id belongs to `owner_id`.
    async fn revoke_api_key(&self, owner_id: &str, key_id: &str) -> StoreResult<bool>;

    async fn create_refresh_session(&self, session: &RefreshSession) -> StoreResult<()>;

    async fn find_refresh_session(&self, session_id: &str) -> StoreResult<Option<RefreshSession>>;

    /// Atomically replace the session's token hash, conditioned on the
    /// stored hash still equal to `expected_old_hash` and the session
    /// not revoked.
    async fn upsert_refresh_session(
        &self,
        session_id: &str,
        expected_old_hash: &str,
        new_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<SessionSwap>;

    /// Revoke a session. Returns true if this call changed its state.
    async fn revoke_session(&self, session_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;
}

/// Run a read at most twice: once, and once more if the first failure was transient.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            debug!(error = %e, "transient store error, retrying once");
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_transient_retries_once() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: StoreResult<u32> = retry_transient(move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Unavailable("blip".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up_after_second_failure() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: StoreResult<u32> = retry_transient(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: StoreResult<u32> = retry_transient(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Corrupt {
                table: "users".into(),
                reason: "bad".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
