//! HTTP surface: router, handlers and startup wiring.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use projectgate_common::{CredentialStore, Database};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::api_keys::{ApiKeySummary, CreateApiKeyRequest, CreatedApiKey};
use crate::auth::audit::{AuditSink, CompositeAuditSink, SqliteAuditSink, TracingAuditSink};
use crate::auth::clock::{Clock, SystemClock};
use crate::auth::middleware::{
    assign_request_id, client_identifier, request_id_of, require_auth, require_permission,
};
use crate::auth::password::PasswordService;
use crate::auth::rbac::{default_policy, PolicyEngine, SYSADMIN};
use crate::auth::service::{AuthServiceParts, UserSummary};
use crate::auth::types::{
    AuthMethod, LoginRequest, Principal, RefreshRequest, RegistrationRequest, RequestContext,
    RequestId, TokenPair,
};
use crate::auth::{
    ApiKeyService, AuthService, AuthenticationResolver, FixedWindowLimiter, TokenService,
};
use crate::config::ValidatedConfig;
use crate::error::{ApiError, AuthError};

/// Shared, read-only application state.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub resolver: Arc<AuthenticationResolver>,
    pub api_keys: Arc<ApiKeyService>,
    pub policy: Arc<PolicyEngine>,
    pub limiter: Arc<FixedWindowLimiter>,
}

/// Build every auth component from validated configuration.
///
/// This is the only place components are constructed; nothing is mutated
/// after it returns.
pub fn compose(
    config: &ValidatedConfig,
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    passwords: PasswordService,
) -> AppState {
    let tokens = Arc::new(TokenService::new(
        config.access_ring.clone(),
        config.refresh_ring.clone(),
        config.access_ttl,
        config.refresh_ttl,
        clock.clone(),
    ));
    let limiter = Arc::new(FixedWindowLimiter::new(config.rate_limit, clock.clone()));
    let policy = Arc::new(PolicyEngine::with_policy(default_policy()));
    let api_keys = Arc::new(ApiKeyService::new(store.clone(), audit.clone(), clock.clone()));
    let resolver = Arc::new(AuthenticationResolver::new(tokens.clone(), api_keys.clone()));

    let auth = Arc::new(AuthService::new(AuthServiceParts {
        store,
        tokens,
        limiter: limiter.clone(),
        passwords,
        policy: policy.clone(),
        audit,
        clock,
        password_min_length: config.password_min_length,
        rate_key_mode: config.rate_key_mode,
    }));

    AppState {
        auth,
        resolver,
        api_keys,
        policy,
        limiter,
    }
}

/// Create router
pub fn router(state: AppState) -> Router {
    let users = Router::new()
        .route("/users", post(create_user_handler))
        .route_layer(middleware::from_fn_with_state(
            state.policy.clone(),
            require_permission(&["user:create"]),
        ));

    let api_keys = Router::new()
        .route("/api-keys", get(list_api_keys_handler).post(create_api_key_handler))
        .route("/api-keys/:key_id", delete(revoke_api_key_handler))
        .route_layer(middleware::from_fn_with_state(
            state.policy.clone(),
            require_permission(&["api_key:manage"]),
        ));

    let rbac = Router::new()
        .route("/rbac/roles", get(list_roles_handler))
        .route_layer(middleware::from_fn_with_state(
            state.policy.clone(),
            require_permission(&["rbac:read"]),
        ));

    // Protected routes (require a bearer token or api key)
    let protected_routes = Router::new()
        .route("/me", get(whoami_handler))
        .merge(users)
        .merge(api_keys)
        .merge(rbac)
        .route_layer(middleware::from_fn_with_state(
            state.resolver.clone(),
            require_auth,
        ));

    // Public routes (no auth required)
    Router::new()
        .route("/health", get(health_handler))
        .route("/login", post(login_handler))
        .route("/refresh", post(refresh_handler))
        .route("/logout", post(logout_handler))
        .merge(protected_routes)
        .fallback(not_found_handler)
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

/// Open the store, bootstrap the admin account and serve until the listener fails.
pub async fn serve(config: ValidatedConfig) -> anyhow::Result<()> {
    let db = if config.db_path == ":memory:" {
        Database::open_memory()?
    } else {
        Database::open(&config.db_path)?
    };
    let audit: Arc<dyn AuditSink> = Arc::new(CompositeAuditSink::new(vec![
        Arc::new(TracingAuditSink),
        Arc::new(SqliteAuditSink::new(db.clone())),
    ]));

    let state = compose(
        &config,
        Arc::new(db),
        audit,
        Arc::new(SystemClock),
        PasswordService::new()?,
    );

    if let Some(admin) = &config.bootstrap_admin {
        let roles = [SYSADMIN.to_string()].into_iter().collect();
        if state.auth.ensure_user(&admin.email, &admin.password, roles).await? {
            info!(email = %admin.email, "Created bootstrap admin");
        }
    }

    let purge = state.limiter.clone().start_purge_task();

    info!("ProjectGate listening on http://{}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    let result = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;

    purge.abort();
    result?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

trait ForRequest<T> {
    fn for_request(self, request_id: &RequestId) -> Result<T, ApiError>;
}

impl<T> ForRequest<T> for Result<T, AuthError> {
    fn for_request(self, request_id: &RequestId) -> Result<T, ApiError> {
        self.map_err(|e| e.for_request(request_id))
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AuthError::Validation(rejection.body_text()))
}

/// Run a state-changing flow on its own task so a dropped connection
/// cannot interrupt it after the store has committed.
async fn detached<T, F>(flow: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(flow).await?
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "projectgate",
        "version": projectgate_common::VERSION,
    }))
}

async fn not_found_handler(request: Request) -> ApiError {
    AuthError::NotFound {
        kind: "route".to_string(),
    }
    .for_request(&request_id_of(&request))
}

async fn login_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<TokenPair>, ApiError> {
    let LoginRequest { email, password } = json_body(payload).for_request(&request_id)?;
    let client = client_identifier(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let auth = state.auth.clone();
    let pair = detached(async move { auth.login(&email, &password, client.as_deref()).await })
        .await
        .for_request(&request_id)?;
    Ok(Json(pair))
}

async fn refresh_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenPair>, ApiError> {
    let RefreshRequest { refresh_token } = json_body(payload).for_request(&request_id)?;

    let auth = state.auth.clone();
    let pair = detached(async move { auth.refresh(&refresh_token).await })
        .await
        .for_request(&request_id)?;
    Ok(Json(pair))
}

async fn logout_handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let RefreshRequest { refresh_token } = json_body(payload).for_request(&request_id)?;

    let auth = state.auth.clone();
    let session_state = detached(async move { auth.logout_with_token(&refresh_token).await })
        .await
        .for_request(&request_id)?;
    Ok(Json(json!({ "state": session_state.as_str() })))
}

#[derive(Serialize)]
struct WhoAmI {
    #[serde(flatten)]
    principal: Principal,
    permissions: Vec<String>,
}

async fn whoami_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Json<WhoAmI> {
    let mut permissions: Vec<String> = state
        .policy
        .permissions_for_roles(&ctx.principal.roles)
        .into_iter()
        .collect();
    permissions.sort();
    Json(WhoAmI {
        principal: ctx.principal,
        permissions,
    })
}

async fn create_user_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserSummary>), ApiError> {
    let body = json_body(payload).for_request(&ctx.request_id)?;
    let user = state
        .auth
        .register_user(&body.email, &body.password, body.roles, Some(&ctx.principal))
        .await
        .for_request(&ctx.request_id)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn create_api_key_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedApiKey>), ApiError> {
    // Keys are minted by people, not by other keys.
    if ctx.principal.auth_method == AuthMethod::ApiKey {
        return Err(AuthError::Forbidden {
            permission: "api_key:manage".to_string(),
        }
        .for_request(&ctx.request_id));
    }
    let body = json_body(payload).for_request(&ctx.request_id)?;
    let created = state
        .api_keys
        .create(&ctx.principal.id, body)
        .await
        .for_request(&ctx.request_id)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_api_keys_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Vec<ApiKeySummary>>, ApiError> {
    let keys = state
        .api_keys
        .list(&ctx.principal.id)
        .await
        .for_request(&ctx.request_id)?;
    Ok(Json(keys))
}

async fn revoke_api_key_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .api_keys
        .revoke(&ctx.principal.id, &key_id)
        .await
        .for_request(&ctx.request_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_roles_handler(State(state): State<AppState>) -> impl IntoResponse {
    let roles: Vec<_> = state
        .policy
        .roles()
        .into_iter()
        .map(|role| {
            json!({
                "id": role.id,
                "name": role.name,
                "description": role.description,
                "inherits": role.inherits,
                "permissions": state.policy.effective_permissions(&role.id),
            })
        })
        .collect();
    Json(json!({
        "roles": roles,
        "count": roles.len(),
    }))
}
