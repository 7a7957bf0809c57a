use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::collections::HashMap;

pub type UserId = i64;

/// Maps an opaque bearer token to the user it belongs to.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, token: &str) -> Option<UserId>;
}

/// Token table loaded from configuration.
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }
}

impl IdentityProvider for StaticTokens {
    fn resolve(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token.trim()).copied()
    }
}

/// The caller of a REST request, taken from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        bearer_token(parts)
            .and_then(|token| state.identity.resolve(token))
            .map(AuthUser)
            .ok_or(ApiError::Unauthorized)
    }
}
