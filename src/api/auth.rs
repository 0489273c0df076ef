use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

use super::error::ApiError;
use crate::session::Session;

/// The authenticated caller, inserted into request extensions by
/// [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub admin: bool,
}

/// Whether `identity` may operate on `session`: its owner or an administrator.
pub fn can_access(session: &Session, identity: &Identity) -> bool {
    identity.admin || session.owner() == identity.id
}

/// Bearer tokens accepted by the server and the identity each one maps to.
#[derive(Debug, Default)]
pub struct TokenTable {
    entries: Vec<(String, Identity)>,
}

impl TokenTable {
    pub fn new(entries: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Look up a token. Every entry is compared in constant time and the
    /// same work is done whichever entry matches.
    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let mut index = 0u64;
        let mut found = Choice::from(0);
        for (i, (candidate, _)) in self.entries.iter().enumerate() {
            let hit = token.as_bytes().ct_eq(candidate.as_bytes()) & !found;
            index.conditional_assign(&(i as u64), hit);
            found |= hit;
        }
        if !bool::from(found) {
            return None;
        }
        self.entries
            .get(index as usize)
            .map(|(_, identity)| identity.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Extract a `?token=` value from the query string.
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|v| v.to_string()))
    })
}

fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Resolve the Bearer token to an [`Identity`] and attach it to the request.
/// WebSocket upgrades may pass the token as `?token=` instead.
pub async fn require_auth(
    tokens: Arc<TokenTable>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = match extract_bearer(&req) {
        Some(token) => Some(token),
        None if is_ws_upgrade(&req) => extract_query_token(&req),
        None => None,
    };
    let Some(token) = token else {
        return Err(ApiError::AuthRequired);
    };
    let identity = tokens.resolve(&token).ok_or(ApiError::AuthInvalid)?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
