//! ProjectGate Common Library
//!
//! Credential records, the credential store abstraction and its SQLite
//! and in-memory backends.

pub mod crypto;
pub mod db;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryCredentialStore;
pub use store::{retry_transient, CredentialStore};
pub use types::*;

/// ProjectGate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
