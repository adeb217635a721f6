//! Security audit events and the sinks that record them.
//!
//! The auth core only produces [`AuditEvent`] values; where they end up is
//! up to the configured [`AuditSink`]. A sink failure is logged and never
//! fails the flow that produced the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use projectgate_common::{Database, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    TokenRefreshed,
    TokenReuseDetected,
    Logout,
    UserRegistered,
    ApiKeyCreated,
    ApiKeyRevoked,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailure => "LOGIN_FAILURE",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::TokenReuseDetected => "TOKEN_REUSE_DETECTED",
            Self::Logout => "LOGOUT",
            Self::UserRegistered => "USER_REGISTERED",
            Self::ApiKeyCreated => "API_KEY_CREATED",
            Self::ApiKeyRevoked => "API_KEY_REVOKED",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured audit record. `meta` never holds credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub subject_id: Option<String>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
    pub meta: Value,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        subject_id: Option<&str>,
        outcome: AuditOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            subject_id: subject_id.map(str::to_string),
            outcome,
            timestamp,
            meta: Value::Object(Default::default()),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.meta {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only recorder of audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Record an event, logging rather than propagating sink failures.
pub async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!(
            event_type = %event.event_type,
            subject_id = event.subject_id.as_deref().unwrap_or("-"),
            error = %e,
            "Failed to record audit event"
        );
    }
}

/// Emits each event as a structured `tracing` record on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            event_id = %event.id,
            event_type = %event.event_type,
            subject_id = event.subject_id.as_deref().unwrap_or("-"),
            outcome = %event.outcome,
            meta = %event.meta,
            "audit"
        );
        Ok(())
    }
}

/// Persists events to the `auth_audit_log` table.
#[derive(Clone)]
pub struct SqliteAuditSink {
    db: Database,
}

impl SqliteAuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Most recent events first
    pub async fn recent(&self, limit: usize) -> Result<Vec<(String, Option<String>, String)>, AuditError> {
        let rows = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_type, subject_id, outcome FROM auth_audit_log \
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let mut out: Vec<(String, Option<String>, String)> = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let meta_json = serde_json::to_string(&event.meta)?;
        let event = event.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO auth_audit_log (id, timestamp, event_type, subject_id, outcome, meta_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        event.id,
                        event.timestamp.timestamp_millis(),
                        event.event_type.as_str(),
                        event.subject_id,
                        event.outcome.as_str(),
                        meta_json,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Keeps events in memory. Used by tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fans an event out to several sinks; every sink is attempted.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
