// Request authorization for protected relay routes.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::RelayError;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "api_key";

/// Single predicate consulted before any adapter operation.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, parts: &Parts) -> bool;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _parts: &Parts) -> bool {
        true
    }
}

/// Shared-secret check. The key may arrive as `x-api-key`, as a bearer
/// token, or as an `api_key` query parameter (media elements cannot set
/// headers on segment fetches).
#[derive(Clone)]
pub struct ApiKeyAuthorizer {
    key: Arc<String>,
}

impl ApiKeyAuthorizer {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Arc::new(key.into()),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        candidate.len() == self.key.len()
            && bool::from(candidate.as_bytes().ct_eq(self.key.as_bytes()))
    }
}

impl std::fmt::Debug for ApiKeyAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuthorizer").finish_non_exhaustive()
    }
}

impl Authorizer for ApiKeyAuthorizer {
    fn authorize(&self, parts: &Parts) -> bool {
        if let Some(value) = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            return self.matches(value.trim());
        }

        if let Some(token) = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return self.matches(token.trim());
        }

        parts
            .uri
            .query()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == API_KEY_QUERY)
                    .map(|(_, v)| v.into_owned())
            })
            .is_some_and(|v| self.matches(&v))
    }
}

/// Build the authorizer a config asks for.
pub fn from_api_key(api_key: Option<&str>) -> Arc<dyn Authorizer> {
    match api_key.filter(|k| !k.is_empty()) {
        Some(key) => Arc::new(ApiKeyAuthorizer::new(key)),
        None => Arc::new(AllowAll),
    }
}

/// Middleware applied to every protected route.
pub async fn require_auth(
    State(authorizer): State<Arc<dyn Authorizer>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    if !authorizer.authorize(&parts) {
        warn!("rejected unauthorized {} {}", parts.method, parts.uri.path());
        return RelayError::Unauthorized.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}
