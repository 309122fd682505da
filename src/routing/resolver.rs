//! Resolver contract.
//!
//! # Responsibilities
//! - Define the per-route `Resolver` trait
//! - Define the value a resolver produces (`ResolvedTarget`) and the errors
//!   it may raise (`ResolverError`)
//! - Turn a resolver outcome into "forward" or "reject with status", applying
//!   the authentication gate
//!
//! # Design Decisions
//! - Resolvers are synchronous and side-effect free
//! - An empty target URL is the same as `NotFound`
//! - The gate runs before any upstream network activity

use std::fmt;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use url::Url;

use crate::http::request::ProxyRequest;
use crate::net::tls::TlsContext;

/// Maps an inbound request to an upstream target. One implementation per
/// proxied route.
pub trait Resolver: Send + Sync + fmt::Debug {
    fn resolve(&self, request: &ProxyRequest<'_>) -> Result<ResolvedTarget, ResolverError>;
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTarget {
    /// Absolute upstream URL. Empty means "not found".
    pub url: String,
    /// Trust configuration for this call only.
    pub tls: Option<TlsContext>,
    /// Appended, in order, to the upstream URL.
    pub query_params: Option<Vec<(String, String)>>,
    /// Forward even when the host did not authenticate the caller.
    pub allow_unauthenticated: bool,
    /// Merged over the inbound headers, replacing same-named values.
    pub headers: Option<HeaderMap>,
}

impl ResolvedTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_query_params(mut self, params: Vec<(String, String)>) -> Self {
        self.query_params = Some(params);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn allow_unauthenticated(mut self, allow: bool) -> Self {
        self.allow_unauthenticated = allow;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.url.trim().is_empty()
    }

    /// Parsed target URL with the query parameters appended.
    pub fn upstream_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.url)?;
        if let Some(params) = self.query_params.as_ref().filter(|p| !p.is_empty()) {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Errors a resolver may raise. The message is only logged; responses carry
/// an empty body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    /// Anything else a resolver wants to report. Treated as a bad request.
    #[error("{0}")]
    Other(String),
}

impl ResolverError {
    pub fn status(&self) -> StatusCode {
        match self {
            ResolverError::BadRequest(_) | ResolverError::Other(_) => StatusCode::BAD_REQUEST,
            ResolverError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ResolverError::Forbidden(_) => StatusCode::FORBIDDEN,
            ResolverError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolverError::Expired(_) => StatusCode::GONE,
        }
    }
}

impl IntoResponse for ResolverError {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

/// Resolve the request and apply the authentication gate.
///
/// Returns the target to forward to, or the status to answer with.
pub fn authorize(
    resolver: &dyn Resolver,
    request: &ProxyRequest<'_>,
) -> Result<ResolvedTarget, StatusCode> {
    let target = resolver.resolve(request).map_err(|err| {
        tracing::debug!(
            path = %request.uri().path(),
            error = %err,
            "Resolver rejected request"
        );
        err.status()
    })?;

    if target.is_empty() {
        tracing::debug!(path = %request.uri().path(), "Resolver returned no target");
        return Err(StatusCode::NOT_FOUND);
    }

    if !target.allow_unauthenticated && !request.is_authenticated() {
        tracing::debug!(path = %request.uri().path(), "Unauthenticated request rejected");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Authenticated;
    use axum::http::{request::Parts, Request};

    #[derive(Debug)]
    struct Fixed(Result<ResolvedTarget, ResolverError>);

    impl Resolver for Fixed {
        fn resolve(&self, _: &ProxyRequest<'_>) -> Result<ResolvedTarget, ResolverError> {
            self.0.clone()
        }
    }

    fn parts(authenticated: bool) -> Parts {
        let (mut parts, _) = Request::builder().uri("/proxy").body(()).unwrap().into_parts();
        parts.extensions.insert(Authenticated(authenticated));
        parts
    }

    #[test]
    fn error_mapping() {
        let cases = [
            (ResolverError::BadRequest(String::new()), 400),
            (ResolverError::Unauthorized(String::new()), 401),
            (ResolverError::Forbidden(String::new()), 403),
            (ResolverError::NotFound(String::new()), 404),
            (ResolverError::Expired(String::new()), 410),
            (ResolverError::Other(String::new()), 400),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err:?}");
        }
    }

    #[test]
    fn resolver_errors_become_status() {
        let parts = parts(true);
        let resolver = Fixed(Err(ResolverError::Expired("link expired".into())));
        let status = authorize(&resolver, &ProxyRequest::new(&parts)).unwrap_err();
        assert_eq!(status, StatusCode::GONE);
    }

    #[test]
    fn empty_url_is_not_found() {
        let parts = parts(true);
        for url in ["", "   "] {
            let resolver = Fixed(Ok(ResolvedTarget::new(url).allow_unauthenticated(true)));
            let status = authorize(&resolver, &ProxyRequest::new(&parts)).unwrap_err();
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn gate_requires_authentication_unless_allowed() {
        let anonymous = parts(false);
        let resolver = Fixed(Ok(ResolvedTarget::new("http://10.0.0.5/")));
        let status = authorize(&resolver, &ProxyRequest::new(&anonymous)).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let open = Fixed(Ok(ResolvedTarget::new("http://10.0.0.5/").allow_unauthenticated(true)));
        assert!(authorize(&open, &ProxyRequest::new(&anonymous)).is_ok());

        let signed_in = parts(true);
        assert!(authorize(&resolver, &ProxyRequest::new(&signed_in)).is_ok());
    }

    #[test]
    fn upstream_url_appends_query_params_in_order() {
        let target = ResolvedTarget::new("http://10.0.0.5:6095/app-icon.png?size=64")
            .with_query_params(vec![("b".into(), "2".into()), ("a".into(), "1 2".into())]);
        assert_eq!(
            target.upstream_url().unwrap().as_str(),
            "http://10.0.0.5:6095/app-icon.png?size=64&b=2&a=1+2"
        );

        let plain = ResolvedTarget::new("http://10.0.0.5:6095/app-icon.png").with_query_params(vec![]);
        assert_eq!(plain.upstream_url().unwrap().as_str(), "http://10.0.0.5:6095/app-icon.png");
    }
}
