//! End-to-end flows through the auth service, store and token service.

mod common;

use chrono::Duration;
use std::sync::Arc;

use common::{harness, harness_with, roles, settings, PASSWORD};
use projectgate_common::SessionState;
use projectgate_web::auth::api_keys::CreateApiKeyRequest;
use projectgate_web::auth::clock::ManualClock;
use projectgate_web::auth::rbac::{SYSADMIN, TEAM_MEMBER, VIEWER};
use projectgate_web::auth::{AuditEventType, Principal, SecretRing, TokenClass, TokenService, VerificationFailure};
use projectgate_web::AuthError;

#[tokio::test]
async fn login_then_verify_yields_same_subject() {
    let h = harness();
    let id = h.user("Ada@Example.com", &[TEAM_MEMBER]).await;

    let pair = h
        .state
        .auth
        .login(" ada@example.com ", PASSWORD, None)
        .await
        .unwrap();
    assert_eq!(pair.expires_in, 900);

    let verified = h
        .state
        .auth
        .tokens()
        .verify(&pair.access_token, TokenClass::Access)
        .unwrap();
    assert_eq!(verified.subject_id, id);
    assert_eq!(verified.roles, roles(&[TEAM_MEMBER]));
    assert_eq!(verified.session_id.as_deref(), Some(pair.session_id.as_str()));
    assert_eq!(h.audit.of_type(AuditEventType::LoginSuccess).len(), 1);
}

#[tokio::test]
async fn wrong_password_and_unknown_account_look_the_same() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;

    let wrong = h.state.auth.login("ada@example.com", "not the password", None).await;
    let unknown = h.state.auth.login("nobody@example.com", PASSWORD, None).await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
    assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));
    assert_eq!(h.audit.of_type(AuditEventType::LoginFailure).len(), 2);
}

#[tokio::test]
async fn superseded_refresh_token_revokes_the_session() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;
    let first = h.state.auth.login("ada@example.com", PASSWORD, None).await.unwrap();

    let second = h.state.auth.refresh(&first.refresh_token).await.unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_ne!(second.refresh_token, first.refresh_token);

    assert!(matches!(
        h.state.auth.refresh(&first.refresh_token).await,
        Err(AuthError::TokenReuseDetected)
    ));
    // The latest token is dead too.
    assert!(matches!(
        h.state.auth.refresh(&second.refresh_token).await,
        Err(AuthError::TokenReuseDetected)
    ));
    assert!(!h.audit.of_type(AuditEventType::TokenReuseDetected).is_empty());
}

#[tokio::test]
async fn access_token_is_not_a_refresh_token() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;
    let pair = h.state.auth.login("ada@example.com", PASSWORD, None).await.unwrap();

    assert!(matches!(
        h.state.auth.refresh(&pair.access_token).await,
        Err(AuthError::Unauthenticated(_))
    ));
    // Still usable: a class mismatch is not a replay.
    assert!(h.state.auth.refresh(&pair.refresh_token).await.is_ok());
}

#[tokio::test]
async fn logout_is_idempotent() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;
    let pair = h.state.auth.login("ada@example.com", PASSWORD, None).await.unwrap();

    assert_eq!(
        h.state.auth.logout(&pair.session_id).await.unwrap(),
        SessionState::Revoked
    );
    assert_eq!(
        h.state.auth.logout(&pair.session_id).await.unwrap(),
        SessionState::Revoked
    );
    assert_eq!(
        h.state.auth.logout_with_token(&pair.refresh_token).await.unwrap(),
        SessionState::Revoked
    );
    assert!(h.state.auth.refresh(&pair.refresh_token).await.is_err());
}

#[tokio::test]
async fn rotated_secret_keeps_old_tokens_valid_until_expiry() {
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let access = SecretRing::new("old-access-secret-0123", vec![]);
    let refresh = SecretRing::new("refresh-secret-0123456789abcdefghijkl", vec![]);
    let before = TokenService::new(
        access.clone(),
        refresh.clone(),
        Duration::seconds(900),
        Duration::seconds(3600),
        clock.clone(),
    );
    let issued = before
        .issue_access_token("u1", &roles(&[VIEWER]), None)
        .unwrap();

    let verified = before.verify(&issued.token, TokenClass::Access).unwrap();
    assert_eq!(verified.subject_id, "u1");
    assert_eq!(verified.roles, roles(&[VIEWER]));

    let after = TokenService::new(
        access.rotated("new-access-secret-0123"),
        refresh,
        Duration::seconds(900),
        Duration::seconds(3600),
        clock.clone(),
    );
    assert_eq!(
        after.verify(&issued.token, TokenClass::Access).unwrap().subject_id,
        "u1"
    );

    clock.advance(Duration::seconds(901));
    assert_eq!(
        after.verify(&issued.token, TokenClass::Access).unwrap_err(),
        VerificationFailure::Expired
    );
}

#[tokio::test]
async fn fourth_attempt_in_window_is_rate_limited() {
    let mut s = settings();
    s.rate_limit_max_attempts = 3;
    s.rate_limit_window_ms = 60_000;
    let h = harness_with(s);
    h.user("ada@example.com", &[VIEWER]).await;

    for _ in 0..3 {
        assert!(matches!(
            h.state.auth.login("ada@example.com", "wrong password!", None).await,
            Err(AuthError::InvalidCredentials)
        ));
    }
    // Correct credentials do not help inside the window.
    assert!(matches!(
        h.state.auth.login("ada@example.com", PASSWORD, None).await,
        Err(AuthError::RateLimited { .. })
    ));

    h.clock.advance(Duration::seconds(61));
    assert!(h.state.auth.login("ada@example.com", PASSWORD, None).await.is_ok());
}

#[tokio::test]
async fn rbac_denies_without_grant() {
    let h = harness();
    let member = Principal::bearer("u1", roles(&[TEAM_MEMBER]), None);
    let sysadmin = Principal::bearer("u2", roles(&[SYSADMIN]), None);
    let nobody = Principal::bearer("u3", roles(&[]), None);

    assert!(!h.state.policy.has_permission(&member, &["user:delete"]));
    assert!(h.state.policy.has_permission(&sysadmin, &["user:delete"]));
    assert!(h.state.policy.has_permission(&member, &["task:create"]));
    for permission in ["project:read", "task:read", "user:create", "anything:at-all"] {
        assert!(!h.state.policy.has_permission(&nobody, &[permission]));
    }
}

#[tokio::test]
async fn api_key_expires_after_one_day() {
    let h = harness();
    let owner = h.user("ada@example.com", &[TEAM_MEMBER]).await;
    let created = h
        .state
        .api_keys
        .create(
            &owner,
            CreateApiKeyRequest {
                name: "ci".to_string(),
                scopes: Default::default(),
                expires_in_days: Some(1),
            },
        )
        .await
        .unwrap();
    assert!(created.key.starts_with("pgk_"));

    let principal = h.state.api_keys.authenticate(&created.key).await.unwrap();
    assert_eq!(principal.id, owner);

    h.clock.advance(Duration::days(1) - Duration::seconds(1));
    assert!(h.state.api_keys.authenticate(&created.key).await.is_ok());

    h.clock.advance(Duration::seconds(1));
    assert!(matches!(
        h.state.api_keys.authenticate(&created.key).await,
        Err(AuthError::InvalidApiKey)
    ));
}

#[tokio::test]
async fn transient_store_fault_is_retried_on_login() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;
    h.store.inject_transient_faults(1);
    assert!(h.state.auth.login("ada@example.com", PASSWORD, None).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_exactly_one_winner() {
    let h = harness();
    h.user("ada@example.com", &[VIEWER]).await;

    for _ in 0..10 {
        let pair = h.state.auth.login("ada@example.com", PASSWORD, None).await.unwrap();

        let (a, b) = {
            let auth_a = h.state.auth.clone();
            let auth_b = h.state.auth.clone();
            let token_a = pair.refresh_token.clone();
            let token_b = pair.refresh_token.clone();
            tokio::join!(
                tokio::spawn(async move { auth_a.refresh(&token_a).await }),
                tokio::spawn(async move { auth_b.refresh(&token_b).await }),
            )
        };
        let results = [a.unwrap(), b.unwrap()];

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AuthError::TokenReuseDetected))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_guesses_share_one_window() {
    let mut s = settings();
    s.rate_limit_max_attempts = 3;
    let h = harness_with(s);
    h.user("ada@example.com", &[VIEWER]).await;

    let attempts: Vec<_> = (0..40)
        .map(|i| {
            let auth = h.state.auth.clone();
            tokio::spawn(async move {
                auth.login("ada@example.com", &format!("guess-number-{i}"), None)
                    .await
            })
        })
        .collect();

    let mut evaluated = 0;
    let mut limited = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Err(AuthError::InvalidCredentials) => evaluated += 1,
            Err(AuthError::RateLimited { .. }) => limited += 1,
            other => panic!("unexpected login result {other:?}"),
        }
    }
    assert!(evaluated <= 3, "{evaluated} guesses were checked");
    assert_eq!(evaluated + limited, 40);
}
