//! Fixed-upstream resolver.
//!
//! Maps a route prefix onto one configured base URL:
//! `/devices/tv/{*path}` → `http://10.0.0.5:6095/{path}`. The inbound query
//! string travels as ordered query parameters.

use axum::http::HeaderMap;
use url::Url;

use crate::http::request::ProxyRequest;
use crate::net::tls::TlsContext;
use crate::routing::resolver::{ResolvedTarget, Resolver, ResolverError};

/// Route parameter holding the tail of the path.
pub const TAIL_PARAM: &str = "path";

#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    base: Url,
    allow_unauthenticated: bool,
    headers: Option<HeaderMap>,
    tls: Option<TlsContext>,
}

impl UpstreamResolver {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            allow_unauthenticated: false,
            headers: None,
            tls: None,
        }
    }

    pub fn allow_unauthenticated(mut self, allow: bool) -> Self {
        self.allow_unauthenticated = allow;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers).filter(|h| !h.is_empty());
        self
    }

    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    fn join(&self, tail: &str) -> Url {
        let mut url = self.base.clone();
        let tail = tail.trim_start_matches('/');
        if !tail.is_empty() {
            let path = format!("{}/{}", self.base.path().trim_end_matches('/'), tail);
            url.set_path(&path);
        }
        url
    }
}

impl Resolver for UpstreamResolver {
    fn resolve(&self, request: &ProxyRequest<'_>) -> Result<ResolvedTarget, ResolverError> {
        let tail = request.param(TAIL_PARAM).unwrap_or("");
        if tail.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(ResolverError::Forbidden(format!("path traversal in `{tail}`")));
        }

        let mut target = ResolvedTarget::new(self.join(tail).to_string())
            .allow_unauthenticated(self.allow_unauthenticated);

        let query = request.query_pairs();
        if !query.is_empty() {
            target = target.with_query_params(query);
        }
        if let Some(headers) = &self.headers {
            target = target.with_headers(headers.clone());
        }
        if let Some(tls) = &self.tls {
            target = target.with_tls(tls.clone());
        }
        Ok(target)
    }
}
