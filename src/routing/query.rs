//! `?url=` resolver.
//!
//! The caller names the target itself: `/api/proxy?url=<percent-encoded url>`.
//! Whether that is acceptable is a host decision, expressed through the auth
//! gate (`allow_unauthenticated` stays off by default).

use axum::http::HeaderMap;
use url::Url;

use crate::http::request::ProxyRequest;
use crate::net::tls::TlsContext;
use crate::routing::resolver::{ResolvedTarget, Resolver, ResolverError};

/// Query parameter carrying the target URL.
pub const URL_PARAM: &str = "url";

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

#[derive(Debug, Clone, Default)]
pub struct QueryUrlResolver {
    allow_unauthenticated: bool,
    headers: Option<HeaderMap>,
    tls: Option<TlsContext>,
}

impl QueryUrlResolver {
    pub fn new() -> Self {
        Self::default()
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
}

impl Resolver for QueryUrlResolver {
    fn resolve(&self, request: &ProxyRequest<'_>) -> Result<ResolvedTarget, ResolverError> {
        let raw = request
            .query(URL_PARAM)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ResolverError::BadRequest("missing `url` query parameter".into()))?;

        let url = Url::parse(&raw)
            .map_err(|err| ResolverError::BadRequest(format!("invalid target url: {err}")))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ResolverError::BadRequest(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ResolverError::BadRequest("target url has no host".into()));
        }

        let mut target = ResolvedTarget::new(raw).allow_unauthenticated(self.allow_unauthenticated);
        if let Some(headers) = &self.headers {
            target = target.with_headers(headers.clone());
        }
        if let Some(tls) = &self.tls {
            target = target.with_tls(tls.clone());
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{request::Parts, HeaderValue, Request};

    fn parts(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn resolve(uri: &str) -> Result<ResolvedTarget, ResolverError> {
        let parts = parts(uri);
        QueryUrlResolver::new().resolve(&ProxyRequest::new(&parts))
    }

    #[test]
    fn resolves_encoded_url_verbatim() {
        let target = resolve("/api/proxy?url=http%3A%2F%2F10.0.0.5%3A6095%2Fapp-icon.png").unwrap();
        assert_eq!(target.url, "http://10.0.0.5:6095/app-icon.png");
        assert!(!target.allow_unauthenticated);
        assert!(target.headers.is_none());
    }

    #[test]
    fn missing_or_blank_url_is_bad_request() {
        for uri in ["/api/proxy", "/api/proxy?url=", "/api/proxy?url=%20%20", "/api/proxy?other=1"] {
            assert!(
                matches!(resolve(uri), Err(ResolverError::BadRequest(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn rejects_relative_and_unsupported_urls() {
        assert!(matches!(resolve("/p?url=%2Fetc%2Fpasswd"), Err(ResolverError::BadRequest(_))));
        assert!(matches!(resolve("/p?url=file%3A%2F%2F%2Fetc%2Fpasswd"), Err(ResolverError::BadRequest(_))));
        assert!(matches!(resolve("/p?url=ftp%3A%2F%2Fhost%2Ff"), Err(ResolverError::BadRequest(_))));
    }

    #[test]
    fn accepts_websocket_urls() {
        let target = resolve("/p?url=ws%3A%2F%2F10.0.0.5%3A6095%2Fsocket").unwrap();
        assert_eq!(target.url, "ws://10.0.0.5:6095/socket");
    }

    #[test]
    fn carries_route_options() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k"));
        let resolver = QueryUrlResolver::new()
            .allow_unauthenticated(true)
            .with_headers(headers);
        let parts = parts("/p?url=http%3A%2F%2Fdevice%2F");
        let target = resolver.resolve(&ProxyRequest::new(&parts)).unwrap();
        assert!(target.allow_unauthenticated);
        assert_eq!(target.headers.unwrap().get("x-api-key").unwrap(), "k");
    }
}
