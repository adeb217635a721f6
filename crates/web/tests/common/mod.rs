#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use projectgate_common::MemoryCredentialStore;
use projectgate_web::auth::audit::MemoryAuditSink;
use projectgate_web::auth::clock::ManualClock;
use projectgate_web::auth::password::PasswordService;
use projectgate_web::{compose, AppState, AuthSettings};

pub const PASSWORD: &str = "correct horse battery";
pub const ACCESS_SECRET: &str = "access-secret-0123456789";
pub const REFRESH_SECRET: &str = "refresh-secret-0123456789abcdefghijkl";

pub struct Harness {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub audit: Arc<MemoryAuditSink>,
    pub store: Arc<MemoryCredentialStore>,
}

pub fn settings() -> AuthSettings {
    AuthSettings {
        db_path: ":memory:".to_string(),
        access_token_secret: Some(ACCESS_SECRET.to_string()),
        refresh_token_secret: Some(REFRESH_SECRET.to_string()),
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(settings())
}

pub fn harness_with(settings: AuthSettings) -> Harness {
    let config = settings.validate().expect("test settings are valid");
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let audit = Arc::new(MemoryAuditSink::new());
    let store = Arc::new(MemoryCredentialStore::new());
    let state = compose(
        &config,
        store.clone(),
        audit.clone(),
        clock.clone(),
        PasswordService::with_cost(8, 1, 1).expect("cheap argon2 params"),
    );
    Harness {
        state,
        clock,
        audit,
        store,
    }
}

pub fn roles(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|r| r.to_string()).collect()
}

impl Harness {
    /// Register a user with [`PASSWORD`] and return its id.
    pub async fn user(&self, email: &str, role_names: &[&str]) -> String {
        self.state
            .auth
            .register_user(email, PASSWORD, roles(role_names), None)
            .await
            .expect("register user")
            .id
    }
}
