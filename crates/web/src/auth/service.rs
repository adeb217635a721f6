//! Login, refresh and logout flows.
//!
//! A refresh session moves ACTIVE -> (rotation, generation + 1) -> ACTIVE
//! until it is REVOKED, which is terminal. Presenting a superseded refresh
//! token, or any token for a revoked session, is treated as a replay and
//! revokes the session.

use chrono::{DateTime, Utc};
use projectgate_common::crypto::{constant_time_eq, hash_secret};
use projectgate_common::{
    retry_transient, CredentialStore, RefreshSession, SessionState, SessionSwap, UserRecord,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::audit::{emit, AuditEvent, AuditEventType, AuditOutcome, AuditSink};
use super::clock::Clock;
use super::password::PasswordService;
use super::rate_limit::{FixedWindowLimiter, RateKey, RateKeyMode};
use super::rbac::PolicyEngine;
use super::tokens::TokenService;
use super::types::{Principal, TokenClass, TokenPair};
use crate::error::{AuthError, UnauthenticatedReason};

const MAX_PASSWORD_LEN: usize = 1024;
const MAX_EMAIL_LEN: usize = 254;

/// Public view of a user account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    pub roles: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl From<UserRecord> for UserSummary {
    fn from(u: UserRecord) -> Self {
        Self {
            id: u.id,
            email: u.email,
            roles: u.roles,
            created_at: u.created_at,
        }
    }
}

/// Trimmed, lowercased email.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    tokens: Arc<TokenService>,
    limiter: Arc<FixedWindowLimiter>,
    passwords: PasswordService,
    policy: Arc<PolicyEngine>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    password_min_length: usize,
    rate_key_mode: RateKeyMode,
}

/// Constructor arguments for [`AuthService`].
pub struct AuthServiceParts {
    pub store: Arc<dyn CredentialStore>,
    pub tokens: Arc<TokenService>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub passwords: PasswordService,
    pub policy: Arc<PolicyEngine>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub password_min_length: usize,
    pub rate_key_mode: RateKeyMode,
}

impl AuthService {
    pub fn new(parts: AuthServiceParts) -> Self {
        Self {
            store: parts.store,
            tokens: parts.tokens,
            limiter: parts.limiter,
            passwords: parts.passwords,
            policy: parts.policy,
            audit: parts.audit,
            clock: parts.clock,
            password_min_length: parts.password_min_length,
            rate_key_mode: parts.rate_key_mode,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Create a user account.
    ///
    /// When `assigner` is given, every requested role must be one the
    /// assigner could hand out without gaining anything.
    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        roles: BTreeSet<String>,
        assigner: Option<&Principal>,
    ) -> Result<UserSummary, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;
        let length = password.chars().count();
        if length < self.password_min_length {
            return Err(AuthError::Validation(format!(
                "password must be at least {} characters",
                self.password_min_length
            )));
        }
        if length > MAX_PASSWORD_LEN {
            return Err(AuthError::Validation(format!(
                "password must be at most {MAX_PASSWORD_LEN} characters"
            )));
        }
        if let Some(unknown) = roles.iter().find(|r| !self.policy.is_known_role(r)) {
            return Err(AuthError::Validation(format!("unknown role {unknown}")));
        }
        if let Some(assigner) = assigner {
            for role in &roles {
                let single: BTreeSet<String> = [role.clone()].into_iter().collect();
                if !self.policy.can_assign(&assigner.roles, &single) {
                    return Err(AuthError::Forbidden {
                        permission: format!("role:{role}"),
                    });
                }
            }
        }

        let passwords = self.passwords.clone();
        let plain = password.to_string();
        let password_hash =
            tokio::task::spawn_blocking(move || passwords.hash_password(&plain)).await??;

        let now = self.clock.now();
        let user = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash,
            roles,
            created_at: now,
        };
        self.store.insert_user(&user).await?;

        info!(subject_id = %user.id, "Registered user");
        let mut event = AuditEvent::new(
            AuditEventType::UserRegistered,
            Some(&user.id),
            AuditOutcome::Success,
            now,
        );
        if let Some(assigner) = assigner {
            event = event.with_meta("registeredBy", assigner.id.clone());
        }
        emit(self.audit.as_ref(), event).await;

        Ok(user.into())
    }

    /// Create the account unless one with this email exists. Returns whether
    /// a user was created.
    pub async fn ensure_user(
        &self,
        email: &str,
        password: &str,
        roles: BTreeSet<String>,
    ) -> Result<bool, AuthError> {
        let normalized = normalize_email(email);
        let store = &self.store;
        let lookup = normalized.as_str();
        if retry_transient(move || store.find_user_by_email(lookup))
            .await?
            .is_some()
        {
            debug!("Bootstrap user already present");
            return Ok(false);
        }
        match self.register_user(&normalized, password, roles, None).await {
            Ok(_) => Ok(true),
            // Lost a race with another instance.
            Err(AuthError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Exchange email and password for a token pair.
    ///
    /// `client` identifies the caller (e.g. its address) and is only used
    /// when the limiter keys on account and client.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        let email = normalize_email(email);
        let key = RateKey::login(self.rate_key_mode, &email, client);

        // Claim a slot before touching the store; concurrent attempts each
        // take their own.
        let gate = self.limiter.attempt(&key);
        if !gate.allowed {
            let now = self.clock.now();
            warn!(outcome = "rate_limited", "Login throttled");
            self.audit_login_failure(None, "rate_limited", now).await;
            return Err(AuthError::RateLimited {
                reset_at: gate.reset_at,
                retry_after_secs: gate.retry_after_secs(now),
            });
        }

        let store = &self.store;
        let lookup = email.as_str();
        let user = retry_transient(move || store.find_user_by_email(lookup)).await?;

        let passwords = self.passwords.clone();
        let plain = password.to_string();
        let stored_hash = user.as_ref().map(|u| u.password_hash.clone());
        let verified = tokio::task::spawn_blocking(move || match stored_hash {
            Some(hash) => passwords.verify_password(&plain, &hash),
            None => passwords.verify_dummy(&plain),
        })
        .await?;

        let user = match user {
            Some(user) if verified => user,
            other => {
                let subject = other.as_ref().map(|u| u.id.as_str());
                info!(subject_id = subject.unwrap_or("-"), outcome = "invalid_credentials", "Login failed");
                self.audit_login_failure(subject, "invalid_credentials", self.clock.now())
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        match self.rate_key_mode {
            // This client proved it knows the password.
            RateKeyMode::AccountAndClient => self.limiter.reset(&key),
            // Failures from other sources against this account stay counted.
            RateKeyMode::Account => self.limiter.refund(&key),
        }
        let pair = self.open_session(&user).await?;

        info!(subject_id = %user.id, session_id = %pair.session_id, outcome = "success", "Login succeeded");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::LoginSuccess,
                Some(&user.id),
                AuditOutcome::Success,
                self.clock.now(),
            )
            .with_meta("sessionId", pair.session_id.clone()),
        )
        .await;
        Ok(pair)
    }

    async fn audit_login_failure(&self, subject: Option<&str>, reason: &str, at: DateTime<Utc>) {
        emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::LoginFailure, subject, AuditOutcome::Failure, at)
                .with_meta("reason", reason),
        )
        .await;
    }

    /// Start a refresh session at generation 0 and mint its first pair.
    async fn open_session(&self, user: &UserRecord) -> Result<TokenPair, AuthError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let refresh = self.tokens.issue_refresh_token(&user.id, &session_id)?;
        let access = self
            .tokens
            .issue_access_token(&user.id, &user.roles, Some(&session_id))?;

        let now = self.clock.now();
        let session = RefreshSession {
            session_id: session_id.clone(),
            subject_id: user.id.clone(),
            current_hash: hash_secret(&refresh.token),
            generation: 0,
            rotated_from: None,
            state: SessionState::Active,
            created_at: now,
            updated_at: now,
            expires_at: refresh.expires_at,
        };
        self.store.create_refresh_session(&session).await?;

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: self.tokens.access_ttl().num_seconds(),
            token_type: "Bearer",
            session_id,
            subject_id: user.id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Rotate a refresh token: the presented token is consumed and a new
    /// pair is returned.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let verified = self.tokens.verify(refresh_token, TokenClass::Refresh)?;
        let session_id = verified
            .session_id
            .ok_or(AuthError::Unauthenticated(UnauthenticatedReason::Invalid))?;

        let store = &self.store;
        let sid = session_id.as_str();
        let session = retry_transient(move || store.find_refresh_session(sid))
            .await?
            .ok_or(AuthError::Unauthenticated(UnauthenticatedReason::Invalid))?;
        if session.subject_id != verified.subject_id {
            return Err(AuthError::Unauthenticated(UnauthenticatedReason::Invalid));
        }

        let presented_hash = hash_secret(refresh_token);
        if session.is_revoked() {
            return Err(self.handle_reuse(&session, "session_revoked").await);
        }
        if !constant_time_eq(&presented_hash, &session.current_hash) {
            return Err(self.handle_reuse(&session, "superseded_token").await);
        }

        let subject = session.subject_id.as_str();
        let Some(user) = retry_transient(move || store.find_user_by_id(subject)).await? else {
            self.store
                .revoke_session(&session.session_id, self.clock.now())
                .await?;
            return Err(AuthError::Unauthenticated(UnauthenticatedReason::Invalid));
        };

        let refresh = self.tokens.issue_refresh_token(&user.id, &session_id)?;
        let swap = self
            .store
            .upsert_refresh_session(
                &session_id,
                &presented_hash,
                &hash_secret(&refresh.token),
                self.clock.now(),
            )
            .await?;
        let rotated = match swap {
            SessionSwap::Swapped(rotated) => rotated,
            // Another request consumed this token between our read and the swap.
            SessionSwap::Conflict => {
                return Err(self.handle_reuse(&session, "concurrent_rotation").await)
            }
        };

        let access = self
            .tokens
            .issue_access_token(&user.id, &user.roles, Some(&session_id))?;

        info!(
            token_class = %TokenClass::Refresh,
            subject_id = %user.id,
            session_id = %session_id,
            generation = rotated.generation,
            outcome = "rotated",
            "Refreshed session"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::TokenRefreshed,
                Some(&user.id),
                AuditOutcome::Success,
                self.clock.now(),
            )
            .with_meta("sessionId", session_id.clone())
            .with_meta("generation", rotated.generation),
        )
        .await;

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: self.tokens.access_ttl().num_seconds(),
            token_type: "Bearer",
            session_id,
            subject_id: user.id,
        })
    }

    /// Revoke the session after a replay signal and build the error to return.
    async fn handle_reuse(&self, session: &RefreshSession, reason: &str) -> AuthError {
        let now = self.clock.now();
        let newly_revoked = match self.store.revoke_session(&session.session_id, now).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to revoke session after token reuse"
                );
                return e.into();
            }
        };

        warn!(
            token_class = %TokenClass::Refresh,
            subject_id = %session.subject_id,
            session_id = %session.session_id,
            reason,
            outcome = "reuse_detected",
            "Refresh token reuse detected; session revoked"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditEventType::TokenReuseDetected,
                Some(&session.subject_id),
                AuditOutcome::Failure,
                now,
            )
            .with_meta("sessionId", session.session_id.clone())
            .with_meta("reason", reason)
            .with_meta("newlyRevoked", newly_revoked),
        )
        .await;
        AuthError::TokenReuseDetected
    }

    // ------------------------------------------------------------------
    // Logout
    // ------------------------------------------------------------------

    /// Revoke a session. Idempotent: revoking a revoked or unknown session
    /// also reports `Revoked`.
    pub async fn logout(&self, session_id: &str) -> Result<SessionState, AuthError> {
        let store = &self.store;
        let session = retry_transient(move || store.find_refresh_session(session_id)).await?;
        let now = self.clock.now();
        let changed = self.store.revoke_session(session_id, now).await?;

        let subject = session.as_ref().map(|s| s.subject_id.as_str());
        let outcome = if changed { "revoked" } else { "already_revoked" };
        info!(
            subject_id = subject.unwrap_or("-"),
            session_id = %session_id,
            outcome,
            "Logout"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditEventType::Logout, subject, AuditOutcome::Success, now)
                .with_meta("sessionId", session_id)
                .with_meta("alreadyRevoked", !changed),
        )
        .await;
        Ok(SessionState::Revoked)
    }

    /// Logout identified by a refresh token rather than a session id.
    pub async fn logout_with_token(&self, refresh_token: &str) -> Result<SessionState, AuthError> {
        let verified = self.tokens.verify(refresh_token, TokenClass::Refresh)?;
        let session_id = verified
            .session_id
            .ok_or(AuthError::Unauthenticated(UnauthenticatedReason::Invalid))?;
        self.logout(&session_id).await
    }
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let valid = email.len() <= MAX_EMAIL_LEN
        && !email.chars().any(char::is_whitespace)
        && matches!(
            email.split_once('@'),
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        );
    if valid {
        Ok(())
    } else {
        Err(AuthError::Validation("email address is invalid".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::audit::MemoryAuditSink;
    use crate::auth::clock::ManualClock;
    use crate::auth::rate_limit::RateLimitConfig;
    use crate::auth::rbac::{ADMIN, SYSADMIN, TEAM_MEMBER};
    use crate::auth::secrets::SecretRing;
    use chrono::Duration;
    use projectgate_common::MemoryCredentialStore;

    const PASSWORD: &str = "correct horse battery";

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryCredentialStore>,
        audit: Arc<MemoryAuditSink>,
        auth: AuthService,
    }

    fn fixture_with(max_attempts: u32) -> Fixture {
        fixture_with_mode(max_attempts, RateKeyMode::Account)
    }

    fn fixture_with_mode(max_attempts: u32, rate_key_mode: RateKeyMode) -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        let store = Arc::new(MemoryCredentialStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let tokens = Arc::new(TokenService::new(
            SecretRing::new("access-secret-0123456789", vec![]),
            SecretRing::new("refresh-secret-0123456789abcdefghijkl", vec![]),
            Duration::seconds(900),
            Duration::seconds(1_209_600),
            clock.clone(),
        ));
        let limiter = Arc::new(FixedWindowLimiter::new(
            RateLimitConfig {
                max_attempts,
                window: Duration::seconds(60),
            },
            clock.clone(),
        ));
        let auth = AuthService::new(AuthServiceParts {
            store: store.clone(),
            tokens,
            limiter,
            passwords: PasswordService::with_cost(8, 1, 1).unwrap(),
            policy: Arc::new(PolicyEngine::new()),
            audit: audit.clone(),
            clock: clock.clone(),
            password_min_length: 12,
            rate_key_mode,
        });
        Fixture {
            clock,
            store,
            audit,
            auth,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(10)
    }

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn register(f: &Fixture, email: &str) -> UserSummary {
        f.auth
            .register_user(email, PASSWORD, roles(&[TEAM_MEMBER]), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_then_verify_returns_subject() {
        let f = fixture();
        let user = register(&f, " Dev@Example.com ").await;
        assert_eq!(user.email, "dev@example.com");

        let pair = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();
        let verified = f
            .auth
            .tokens()
            .verify(&pair.access_token, TokenClass::Access)
            .unwrap();
        assert_eq!(verified.subject_id, user.id);
        assert_eq!(verified.roles, roles(&[TEAM_MEMBER]));
        assert_eq!(pair.expires_in, 900);
        assert_eq!(f.audit.of_type(AuditEventType::LoginSuccess).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_the_same() {
        let f = fixture();
        register(&f, "dev@example.com").await;

        let wrong = f.auth.login("dev@example.com", "not the password", None).await;
        let missing = f.auth.login("nobody@example.com", PASSWORD, None).await;
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
        assert!(matches!(missing, Err(AuthError::InvalidCredentials)));
        assert_eq!(f.audit.of_type(AuditEventType::LoginFailure).len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_regardless_of_correctness() {
        let f = fixture_with(3);
        register(&f, "dev@example.com").await;

        for _ in 0..3 {
            assert!(matches!(
                f.auth.login("dev@example.com", "wrong password!", None).await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        let throttled = f.auth.login("dev@example.com", PASSWORD, None).await;
        let Err(AuthError::RateLimited { reset_at, retry_after_secs }) = throttled else {
            panic!("expected RATE_LIMITED, got {throttled:?}");
        };
        assert_eq!(reset_at, f.clock.now() + Duration::seconds(60));
        assert_eq!(retry_after_secs, 60);

        // Other accounts are unaffected.
        register(&f, "other@example.com").await;
        assert!(f.auth.login("other@example.com", PASSWORD, None).await.is_ok());

        f.clock.advance(Duration::seconds(60));
        assert!(f.auth.login("dev@example.com", PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_successful_login_keeps_account_failures() {
        let f = fixture_with(3);
        register(&f, "dev@example.com").await;
        for _ in 0..2 {
            let _ = f.auth.login("dev@example.com", "wrong password!", None).await;
        }
        // Success does not consume a slot, but earlier failures remain.
        f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();
        assert!(matches!(
            f.auth.login("dev@example.com", "wrong password!", None).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            f.auth.login("dev@example.com", PASSWORD, None).await,
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_successful_login_clears_client_window() {
        let f = fixture_with_mode(3, RateKeyMode::AccountAndClient);
        register(&f, "dev@example.com").await;
        let client = Some("192.0.2.1");
        for _ in 0..2 {
            let _ = f.auth.login("dev@example.com", "wrong password!", client).await;
        }
        f.auth.login("dev@example.com", PASSWORD, client).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                f.auth.login("dev@example.com", "wrong password!", client).await,
                Err(AuthError::InvalidCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_old_token_triggers_reuse() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        let first = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();

        let second = f.auth.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);
        assert_eq!(second.session_id, first.session_id);
        let stored = f
            .store
            .find_refresh_session(&first.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.generation, 1);

        assert!(matches!(
            f.auth.refresh(&first.refresh_token).await,
            Err(AuthError::TokenReuseDetected)
        ));
        // The whole session is dead, including the newest token.
        assert!(matches!(
            f.auth.refresh(&second.refresh_token).await,
            Err(AuthError::TokenReuseDetected)
        ));
        assert!(!f.audit.of_type(AuditEventType::TokenReuseDetected).is_empty());
        assert_eq!(f.audit.of_type(AuditEventType::TokenRefreshed).len(), 1);
    }

    #[tokio::test]
    async fn test_access_token_is_not_a_refresh_token() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        let pair = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();
        assert!(matches!(
            f.auth.refresh(&pair.access_token).await,
            Err(AuthError::Unauthenticated(UnauthenticatedReason::Invalid))
        ));
    }

    #[tokio::test]
    async fn test_expired_refresh_token() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        let pair = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();
        f.clock.advance(Duration::seconds(1_209_601));
        assert!(matches!(
            f.auth.refresh(&pair.refresh_token).await,
            Err(AuthError::Unauthenticated(UnauthenticatedReason::Expired))
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        let pair = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();

        assert_eq!(f.auth.logout(&pair.session_id).await.unwrap(), SessionState::Revoked);
        assert_eq!(f.auth.logout(&pair.session_id).await.unwrap(), SessionState::Revoked);
        assert_eq!(
            f.auth.logout("no-such-session").await.unwrap(),
            SessionState::Revoked
        );
        assert!(matches!(
            f.auth.refresh(&pair.refresh_token).await,
            Err(AuthError::TokenReuseDetected)
        ));
        assert_eq!(f.audit.of_type(AuditEventType::Logout).len(), 3);
    }

    #[tokio::test]
    async fn test_logout_with_token() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        let pair = f.auth.login("dev@example.com", PASSWORD, None).await.unwrap();
        f.auth.logout_with_token(&pair.refresh_token).await.unwrap();
        let stored = f
            .store
            .find_refresh_session(&pair.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_revoked());
    }

    #[tokio::test]
    async fn test_registration_validation() {
        let f = fixture();
        assert!(matches!(
            f.auth
                .register_user("dev@example.com", "short", roles(&[]), None)
                .await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            f.auth
                .register_user("not-an-email", PASSWORD, roles(&[]), None)
                .await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            f.auth
                .register_user("dev@example.com", PASSWORD, roles(&["WIZARD"]), None)
                .await,
            Err(AuthError::Validation(_))
        ));
        register(&f, "dev@example.com").await;
        assert!(matches!(
            f.auth
                .register_user("DEV@example.com", PASSWORD, roles(&[]), None)
                .await,
            Err(AuthError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_cannot_escalate() {
        let f = fixture();
        let admin = Principal::bearer("admin", roles(&[ADMIN]), None);
        assert!(matches!(
            f.auth
                .register_user("root@example.com", PASSWORD, roles(&[SYSADMIN]), Some(&admin))
                .await,
            Err(AuthError::Forbidden { .. })
        ));
        assert!(f
            .auth
            .register_user("member@example.com", PASSWORD, roles(&[TEAM_MEMBER]), Some(&admin))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let f = fixture();
        assert!(f
            .auth
            .ensure_user("root@example.com", PASSWORD, roles(&[SYSADMIN]))
            .await
            .unwrap());
        assert!(!f
            .auth
            .ensure_user("root@example.com", PASSWORD, roles(&[SYSADMIN]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_is_not_reported_as_bad_credentials() {
        let f = fixture();
        register(&f, "dev@example.com").await;
        f.store.inject_transient_faults(2);
        assert!(matches!(
            f.auth.login("dev@example.com", PASSWORD, None).await,
            Err(AuthError::ServiceUnavailable(_))
        ));
        // A single blip is absorbed by the retry.
        f.store.inject_transient_faults(1);
        assert!(f.auth.login("dev@example.com", PASSWORD, None).await.is_ok());
    }
}
