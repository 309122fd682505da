//! Host-side authentication flag.
//!
//! The proxy engines never authenticate anyone themselves. They read the
//! [`Authenticated`] request extension that the host's auth layer attaches.
//! This module provides the reference host's layer: a bearer-token check
//! whose token set can be swapped at runtime when the config file changes.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

/// Per-request flag computed by the host's authentication layer.
///
/// A request without this extension is treated as unauthenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Authenticated(pub bool);

/// Bearer-token authenticator with a hot-swappable token set.
#[derive(Debug, Clone)]
pub struct TokenAuth {
    tokens: Arc<ArcSwap<HashSet<String>>>,
}

impl TokenAuth {
    pub fn new<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            tokens: Arc::new(ArcSwap::from_pointee(collect_tokens(tokens))),
        }
    }

    /// Replace the accepted tokens. In-flight requests keep the old set.
    pub fn replace<I>(&self, tokens: I)
    where
        I: IntoIterator<Item = String>,
    {
        let tokens = collect_tokens(tokens);
        tracing::info!(count = tokens.len(), "Auth tokens reloaded");
        self.tokens.store(Arc::new(tokens));
    }

    /// Whether the request carries an accepted bearer token.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        bearer_token(headers)
            .map(|token| self.tokens.load().contains(token))
            .unwrap_or(false)
    }
}

fn collect_tokens<I>(tokens: I) -> HashSet<String>
where
    I: IntoIterator<Item = String>,
{
    tokens.into_iter().filter(|t| !t.is_empty()).collect()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// Middleware attaching [`Authenticated`] to every request. Never rejects.
pub async fn authenticate(
    State(auth): State<TokenAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authenticated = auth.check(request.headers());
    request.extensions_mut().insert(Authenticated(authenticated));
    next.run(request).await
}
