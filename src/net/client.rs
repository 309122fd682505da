//! Shared upstream client.
//!
//! # Responsibilities
//! - Own the pooled HTTP client used for every proxied call
//! - Hand out a client matching a per-call TLS context, reusing pools
//! - Serve WebSocket upgrades through the same clients, so both engines share
//!   one trust policy
//!
//! # Design Decisions
//! - Redirects are never followed; the caller sees upstream 3xx as-is
//! - Proxy environment variables are ignored: targets are dialed directly
//! - Clients for non-default TLS contexts are cached by context identity, so a
//!   resolver that keeps its context around gets connection reuse too

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

use crate::config::schema::HttpClientConfig;
use crate::net::tls::TlsContext;

/// Upper bound on cached per-context clients. Beyond it, one-off clients are
/// built per call.
const MAX_CACHED_CLIENTS: usize = 32;

/// Errors raised while talking to an upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] axum::http::header::InvalidHeaderValue),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("upstream websocket handshake failed: {0}")]
    Handshake(String),
}

/// Connection settings applied to every upstream client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&HttpClientConfig::default())
    }
}

impl From<&HttpClientConfig> for ClientSettings {
    fn from(config: &HttpClientConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            pool_idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
        }
    }
}

/// Pooled client shared by all proxy engines. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    default_tls: TlsContext,
    default_http: reqwest::Client,
    settings: ClientSettings,
    per_tls: DashMap<usize, (TlsContext, reqwest::Client)>,
}

impl UpstreamClient {
    pub fn new(default_tls: TlsContext, settings: ClientSettings) -> Result<Self, UpstreamError> {
        let default_http = build_http(&default_tls, &settings)?;
        Ok(Self {
            inner: Arc::new(Inner {
                default_tls,
                default_http,
                settings,
                per_tls: DashMap::new(),
            }),
        })
    }

    pub fn default_tls(&self) -> &TlsContext {
        &self.inner.default_tls
    }

    /// HTTP client for one call, honoring a per-call TLS override.
    pub fn http(&self, tls: Option<&TlsContext>) -> Result<reqwest::Client, UpstreamError> {
        let Some(tls) = tls.filter(|t| t.id() != self.inner.default_tls.id()) else {
            return Ok(self.inner.default_http.clone());
        };

        if let Some(entry) = self.inner.per_tls.get(&tls.id()) {
            return Ok(entry.1.clone());
        }

        let client = build_http(tls, &self.inner.settings)?;
        if self.inner.per_tls.len() < MAX_CACHED_CLIENTS {
            self.inner
                .per_tls
                .insert(tls.id(), (tls.clone(), client.clone()));
        } else {
            tracing::debug!("TLS client cache full, using one-off client");
        }
        Ok(client)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.inner.per_tls.len()
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("settings", &self.inner.settings)
            .field("cached_clients", &self.inner.per_tls.len())
            .finish()
    }
}

fn build_http(tls: &TlsContext, settings: &ClientSettings) -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .use_preconfigured_tls(tls.client_config().as_ref().clone())
        .redirect(Policy::none())
        .no_proxy()
        .connect_timeout(settings.connect_timeout)
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .build()
        .map_err(UpstreamError::Build)
}

/// Describe a target for logs without leaking paths, query strings or
/// credentials embedded in it.
pub fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(url) => match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", url.scheme(), host),
            _ => format!("{}:", url.scheme()),
        },
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UpstreamClient {
        UpstreamClient::new(TlsContext::platform_default().unwrap(), ClientSettings::default()).unwrap()
    }

    #[test]
    fn redact_keeps_only_origin() {
        assert_eq!(
            redact("http://user:pw@10.0.0.5:6095/app-icon.png?token=abc"),
            "http://10.0.0.5:6095"
        );
        assert_eq!(redact("https://example.com/a"), "https://example.com:443");
        assert_eq!(redact("not a url"), "<invalid url>");
    }

    #[test]
    fn default_tls_uses_shared_client() {
        let client = client();
        let default = client.default_tls().clone();
        client.http(None).unwrap();
        client.http(Some(&default)).unwrap();
        assert_eq!(client.cached_clients(), 0);
    }

    #[test]
    fn custom_tls_client_is_reused() {
        let client = client();
        let custom = TlsContext::platform_default().unwrap();
        client.http(Some(&custom)).unwrap();
        client.http(Some(&custom.clone())).unwrap();
        assert_eq!(client.cached_clients(), 1);

        let other = TlsContext::platform_default().unwrap();
        client.http(Some(&other)).unwrap();
        assert_eq!(client.cached_clients(), 2);
    }
}
