//! SQLite database for credential persistence

use crate::error::{StoreError, StoreResult};
use crate::store::CredentialStore;
use crate::types::{ApiKeyRecord, RefreshSession, SessionState, SessionSwap, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for credential persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Run a closure against the connection on the blocking pool.
    ///
    /// The closure runs to completion even if the awaiting future is dropped.
    pub async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                roles TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                scopes TEXT NOT NULL DEFAULT '[]',
                expires_at INTEGER,
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(owner_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_owner ON api_keys(owner_id);

            CREATE TABLE IF NOT EXISTS refresh_sessions (
                session_id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                current_hash TEXT NOT NULL,
                generation INTEGER NOT NULL DEFAULT 0,
                rotated_from INTEGER,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_sessions_subject ON refresh_sessions(subject_id);

            CREATE TABLE IF NOT EXISTS auth_audit_log (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                subject_id TEXT,
                outcome TEXT NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON auth_audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_subject ON auth_audit_log(subject_id);
            CREATE INDEX IF NOT EXISTS idx_audit_type ON auth_audit_log(event_type);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(table: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::corrupt(table, format!("timestamp out of range: {ms}")))
}

/// Raw user row before parsing
struct RawUser {
    id: String,
    email: String,
    password_hash: String,
    roles: String,
    created_at: i64,
}

impl RawUser {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            password_hash: row.get(2)?,
            roles: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn parse(self) -> StoreResult<UserRecord> {
        let roles: BTreeSet<String> = serde_json::from_str(&self.roles)?;
        Ok(UserRecord {
            id: self.id,
            email: self.email,
            password_hash: self.password_hash,
            roles,
            created_at: from_millis("users", self.created_at)?,
        })
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, roles, created_at";

struct RawApiKey {
    id: String,
    owner_id: String,
    name: String,
    key_hash: String,
    scopes: String,
    expires_at: Option<i64>,
    revoked: bool,
    created_at: i64,
}

impl RawApiKey {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            key_hash: row.get(3)?,
            scopes: row.get(4)?,
            expires_at: row.get(5)?,
            revoked: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn parse(self) -> StoreResult<ApiKeyRecord> {
        let expires_at = match self.expires_at {
            Some(ms) => Some(from_millis("api_keys", ms)?),
            None => None,
        };
        Ok(ApiKeyRecord {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            key_hash: self.key_hash,
            scopes: serde_json::from_str(&self.scopes)?,
            expires_at,
            revoked: self.revoked,
            created_at: from_millis("api_keys", self.created_at)?,
        })
    }
}

const API_KEY_COLUMNS: &str =
    "id, owner_id, name, key_hash, scopes, expires_at, revoked, created_at";

struct RawSession {
    session_id: String,
    subject_id: String,
    current_hash: String,
    generation: i64,
    rotated_from: Option<i64>,
    state: String,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            subject_id: row.get(1)?,
            current_hash: row.get(2)?,
            generation: row.get(3)?,
            rotated_from: row.get(4)?,
            state: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            expires_at: row.get(8)?,
        })
    }

    fn parse(self) -> StoreResult<RefreshSession> {
        let state = SessionState::parse(&self.state).ok_or_else(|| {
            StoreError::corrupt("refresh_sessions", format!("unknown state {}", self.state))
        })?;
        Ok(RefreshSession {
            session_id: self.session_id,
            subject_id: self.subject_id,
            current_hash: self.current_hash,
            generation: self.generation,
            rotated_from: self.rotated_from,
            state,
            created_at: from_millis("refresh_sessions", self.created_at)?,
            updated_at: from_millis("refresh_sessions", self.updated_at)?,
            expires_at: from_millis("refresh_sessions", self.expires_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, subject_id, current_hash, generation, rotated_from, state, created_at, updated_at, expires_at";

fn load_session(conn: &Connection, session_id: &str) -> StoreResult<Option<RefreshSession>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM refresh_sessions WHERE session_id = ?1"),
            params![session_id],
            RawSession::from_row,
        )
        .optional()?;
    raw.map(RawSession::parse).transpose()
}

fn map_unique_violation(e: rusqlite::Error, kind: &str, key: &str) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
            StoreError::AlreadyExists {
                kind: kind.to_string(),
                key: key.to_string(),
            }
        }
        _ => StoreError::Database(e),
    }
}

// ============================================================================
// Credential store
// ============================================================================

#[async_trait]
impl CredentialStore for Database {
    async fn insert_user(&self, user: &UserRecord) -> StoreResult<()> {
        let user = user.clone();
        let roles = serde_json::to_string(&user.roles)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (id, email, password_hash, roles, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user.id, user.email, user.password_hash, roles, to_millis(user.created_at)],
            )
            .map_err(|e| map_unique_violation(e, "user", &user.email))?;
            debug!(user_id = %user.id, "Inserted user");
            Ok(())
        })
        .await
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let email = email.to_string();
        self.run(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                    params![email],
                    RawUser::from_row,
                )
                .optional()?;
            raw.map(RawUser::parse).transpose()
        })
        .await
    }

    async fn find_user_by_id(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    params![id],
                    RawUser::from_row,
                )
                .optional()?;
            raw.map(RawUser::parse).transpose()
        })
        .await
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> StoreResult<()> {
        let key = key.clone();
        let scopes = serde_json::to_string(&key.scopes)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO api_keys (id, owner_id, name, key_hash, scopes, expires_at, revoked, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key.id,
                    key.owner_id,
                    key.name,
                    key.key_hash,
                    scopes,
                    key.expires_at.map(to_millis),
                    key.revoked,
                    to_millis(key.created_at),
                ],
            )
            .map_err(|e| map_unique_violation(e, "api_key", &key.id))?;
            debug!(key_id = %key.id, owner_id = %key.owner_id, "Inserted api key");
            Ok(())
        })
        .await
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<Option<ApiKeyRecord>> {
        let key_hash = key_hash.to_string();
        self.run(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = ?1"),
                    params![key_hash],
                    RawApiKey::from_row,
                )
                .optional()?;
            raw.map(RawApiKey::parse).transpose()
        })
        .await
    }

    async fn list_api_keys(&self, owner_id: &str) -> StoreResult<Vec<ApiKeyRecord>> {
        let owner_id = owner_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE owner_id = ?1 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map(params![owner_id], RawApiKey::from_row)?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row?.parse()?);
            }
            Ok(results)
        })
        .await
    }

    async fn revoke_api_key(&self, owner_id: &str, key_id: &str) -> StoreResult<bool> {
        let owner_id = owner_id.to_string();
        let key_id = key_id.to_string();
        self.run(move |conn| {
            let rows = conn.execute(
                "UPDATE api_keys SET revoked = 1 WHERE id = ?1 AND owner_id = ?2",
                params![key_id, owner_id],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    async fn create_refresh_session(&self, session: &RefreshSession) -> StoreResult<()> {
        let s = session.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO refresh_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    s.session_id,
                    s.subject_id,
                    s.current_hash,
                    s.generation,
                    s.rotated_from,
                    s.state.as_str(),
                    to_millis(s.created_at),
                    to_millis(s.updated_at),
                    to_millis(s.expires_at),
                ],
            )
            .map_err(|e| map_unique_violation(e, "refresh_session", &s.session_id))?;
            Ok(())
        })
        .await
    }

    async fn find_refresh_session(&self, session_id: &str) -> StoreResult<Option<RefreshSession>> {
        let session_id = session_id.to_string();
        self.run(move |conn| load_session(conn, &session_id)).await
    }

    async fn upsert_refresh_session(
        &self,
        session_id: &str,
        expected_old_hash: &str,
        new_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<SessionSwap> {
        let session_id = session_id.to_string();
        let expected = expected_old_hash.to_string();
        let new_hash = new_hash.to_string();
        self.run(move |conn| {
            // The WHERE clause is the compare half of the compare-and-swap;
            // the connection lock serializes competing writers.
            let rows = conn.execute(
                "UPDATE refresh_sessions \
                 SET current_hash = ?1, rotated_from = generation, generation = generation + 1, updated_at = ?2 \
                 WHERE session_id = ?3 AND current_hash = ?4 AND state = 'ACTIVE'",
                params![new_hash, to_millis(at), session_id, expected],
            )?;
            if rows == 0 {
                return Ok(SessionSwap::Conflict);
            }
            match load_session(conn, &session_id)? {
                Some(session) => Ok(SessionSwap::Swapped(session)),
                None => Ok(SessionSwap::Conflict),
            }
        })
        .await
    }

    async fn revoke_session(&self, session_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let rows = conn.execute(
                "UPDATE refresh_sessions SET state = 'REVOKED', updated_at = ?1 \
                 WHERE session_id = ?2 AND state != 'REVOKED'",
                params![to_millis(at), session_id],
            )?;
            Ok(rows > 0)
        })
        .await
    }
}
