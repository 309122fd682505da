//! Inbound request view handed to resolvers.
//!
//! # Responsibilities
//! - Expose method, URI, headers and route parameters read-only
//! - Carry the host's authentication flag and the connected peer
//! - Derive the forwarding context used by the header transform
//!
//! # Design Decisions
//! - Borrowed from the request parts; the body is never visible to resolvers
//! - Missing extensions degrade gracefully (no peer, unauthenticated)

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, RawPathParams};
use axum::http::{header::HOST, request::Parts, HeaderMap, Method, Uri};

use crate::security::headers::ForwardingContext;
use crate::security::Authenticated;

/// Read-only view of one inbound request.
#[derive(Debug)]
pub struct ProxyRequest<'a> {
    parts: &'a Parts,
    params: Vec<(String, String)>,
    peer: Option<SocketAddr>,
    authenticated: bool,
}

impl<'a> ProxyRequest<'a> {
    /// Build the view from request parts, reading the host-provided
    /// extensions.
    pub fn new(parts: &'a Parts) -> Self {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let authenticated = parts
            .extensions
            .get::<Authenticated>()
            .copied()
            .unwrap_or_default()
            .0;
        Self {
            parts,
            params: Vec::new(),
            peer,
            authenticated,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Route parameter captured by the host's router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// All query parameters in order, percent-decoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let query = self.parts.uri.query().unwrap_or("");
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Host the caller addressed: Host header, else the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.parts.uri.authority().map(|a| a.as_str()))
    }

    /// Forwarding context for the header transform. `default_scheme` is used
    /// when the request URI carries no scheme (the usual HTTP/1.1 case).
    pub fn forwarding(&self, default_scheme: &'a str) -> ForwardingContext<'_> {
        ForwardingContext {
            peer: self.peer.map(|addr| addr.ip()),
            host: self.host(),
            scheme: self.parts.uri.scheme_str().unwrap_or(default_scheme),
        }
    }
}

/// Route parameters of the matched route, empty when the route has none.
pub(crate) async fn route_params(parts: &mut Parts) -> Vec<(String, String)> {
    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(params) => params
            .iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str) -> Parts {
        Request::builder()
            .uri(uri)
            .header(HOST, "hass.local:8123")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn decodes_query_parameters() {
        let parts = parts("/api/proxy?url=http%3A%2F%2F10.0.0.5%3A6095%2Fa.png&x=1&x=2");
        let req = ProxyRequest::new(&parts);
        assert_eq!(req.query("url").as_deref(), Some("http://10.0.0.5:6095/a.png"));
        assert_eq!(req.query("x").as_deref(), Some("1"));
        assert_eq!(req.query_pairs().len(), 3);
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn reads_host_extensions() {
        let mut parts = parts("/api/proxy");
        assert!(!ProxyRequest::new(&parts).is_authenticated());
        assert!(ProxyRequest::new(&parts).peer().is_none());

        parts.extensions.insert(Authenticated(true));
        parts
            .extensions
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:4000".parse().unwrap()));
        let req = ProxyRequest::new(&parts);
        assert!(req.is_authenticated());
        assert_eq!(req.peer().unwrap().port(), 4000);
    }

    #[test]
    fn forwarding_context_falls_back_to_default_scheme() {
        let parts = parts("/api/proxy");
        let req = ProxyRequest::new(&parts);
        let ctx = req.forwarding("https");
        assert_eq!(ctx.scheme, "https");
        assert_eq!(ctx.host, Some("hass.local:8123"));
        assert!(ctx.peer.is_none());
    }

    #[test]
    fn params_lookup() {
        let parts = parts("/files/a/b");
        let req = ProxyRequest::new(&parts).with_params(vec![("path".into(), "a/b".into())]);
        assert_eq!(req.param("path"), Some("a/b"));
        assert_eq!(req.param("other"), None);
    }
}
