//! Error types for the credential store

use thiserror::Error;

/// Result type alias using the store error
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Credential store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource already exists: {kind} with key {key}")]
    AlreadyExists { kind: String, key: String },

    #[error("Corrupt record in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub(crate) fn corrupt(table: &str, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}
