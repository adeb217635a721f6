//! Authentication middleware for Axum.
//!
//! Layering on protected routes, outermost first:
//! `assign_request_id` -> `require_auth` -> `require_permission(..)` -> handler.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use super::api_keys::ApiKeyService;
use super::rbac::PolicyEngine;
use super::tokens::TokenService;
use super::types::{Principal, RequestContext, RequestId, TokenClass};
use crate::error::{AuthError, UnauthenticatedReason};

pub static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Credentials found on a request. Never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        // A present key header is authoritative even when unreadable.
        let api_key = headers.get(&X_API_KEY).map(|v| {
            v.to_str()
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        });
        Self {
            api_key,
            authorization: text(&header::AUTHORIZATION),
        }
    }

    /// The bearer token, if the authorization header uses that scheme.
    fn bearer(&self) -> Option<Result<&str, ()>> {
        let value = self.authorization.as_deref()?;
        Some(match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
                let token = token.trim();
                if token.is_empty() {
                    Err(())
                } else {
                    Ok(token)
                }
            }
            _ => Err(()),
        })
    }
}

/// Turns request credentials into a [`Principal`].
pub struct AuthenticationResolver {
    tokens: Arc<TokenService>,
    api_keys: Arc<ApiKeyService>,
}

impl AuthenticationResolver {
    pub fn new(tokens: Arc<TokenService>, api_keys: Arc<ApiKeyService>) -> Self {
        Self { tokens, api_keys }
    }

    /// An API key wins over a bearer token when both are present.
    pub async fn resolve(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        if let Some(raw_key) = credentials.api_key.as_deref() {
            if raw_key.is_empty() {
                return Err(AuthError::InvalidApiKey);
            }
            return self.api_keys.authenticate(raw_key).await;
        }

        let token = match credentials.bearer() {
            None => return Err(AuthError::Unauthenticated(UnauthenticatedReason::Missing)),
            Some(Err(())) => return Err(AuthError::Unauthenticated(UnauthenticatedReason::Invalid)),
            Some(Ok(token)) => token,
        };

        match self.tokens.verify(token, TokenClass::Access) {
            Ok(verified) => Ok(Principal::bearer(
                verified.subject_id,
                verified.roles,
                verified.session_id,
            )),
            Err(failure) => {
                debug!(token_class = %TokenClass::Access, outcome = %failure, "Bearer token rejected");
                Err(failure.into())
            }
        }
    }
}

/// Client identifier for rate-limit keys: first `X-Forwarded-For` hop,
/// else the peer address.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => peer.map(|addr| addr.ip().to_string()),
    }
}

fn request_id_from(headers: &HeaderMap) -> RequestId {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| {
            !s.is_empty()
                && s.len() <= MAX_REQUEST_ID_LEN
                && s.bytes().all(|b| b.is_ascii_graphic())
        })
        .map(|s| RequestId(s.to_string()))
        .unwrap_or_else(RequestId::generate)
}

/// Request id of a request that went through [`assign_request_id`].
pub fn request_id_of(request: &Request) -> RequestId {
    request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate)
}

/// Attach a [`RequestId`] (honoring an inbound `X-Request-Id`) and echo it
/// on the response.
pub async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request_id_from(request.headers());
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(resolver): State<Arc<AuthenticationResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request_id_of(&request);
    let credentials = Credentials::from_headers(request.headers());

    match resolver.resolve(&credentials).await {
        Ok(principal) => {
            request.extensions_mut().insert(RequestContext {
                request_id,
                principal,
            });
            next.run(request).await
        }
        Err(e) => e.for_request(&request_id).into_response(),
    }
}

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Middleware factory that requires every listed permission
pub fn require_permission(
    permissions: &'static [&'static str],
) -> impl Fn(State<Arc<PolicyEngine>>, Request, Next) -> MiddlewareFuture + Clone {
    move |State(policy): State<Arc<PolicyEngine>>, request: Request, next: Next| -> MiddlewareFuture {
        Box::pin(async move {
            let Some(ctx) = request.extensions().get::<RequestContext>().cloned() else {
                let request_id = request_id_of(&request);
                return AuthError::Unauthenticated(UnauthenticatedReason::Missing)
                    .for_request(&request_id)
                    .into_response();
            };

            if let Some(missing) = policy.first_missing(&ctx.principal, permissions) {
                debug!(subject_id = %ctx.principal.id, permission = missing, "Permission denied");
                return AuthError::Forbidden {
                    permission: missing.to_string(),
                }
                .for_request(&ctx.request_id)
                .into_response();
            }
            if permissions.is_empty() {
                return AuthError::Forbidden {
                    permission: String::new(),
                }
                .for_request(&ctx.request_id)
                .into_response();
            }

            next.run(request).await
        })
    }
}
