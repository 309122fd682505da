//! Configuration schema definitions.
//!
//! This module defines the configuration of the reference host.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy host.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Shared upstream client settings.
    pub client: HttpClientConfig,

    /// Bearer tokens accepted by the host.
    pub auth: AuthConfig,

    /// Proxied routes.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            client: HttpClientConfig::default(),
            auth: AuthConfig::default(),
            routes: default_routes(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("/api/proxy", RouteKind::Http),
        RouteConfig::new("/api/proxy/ws", RouteKind::Websocket),
    ]
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// How long an idle pooled connection is kept, in seconds.
    pub pool_idle_timeout_secs: u64,

    /// Idle connections kept per upstream host.
    pub pool_max_idle_per_host: usize,

    /// Extra trust anchors (PEM) added to the default root store.
    pub ca_bundle: Option<String>,

    /// Largest request body forwarded, in bytes.
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 32,
            ca_bundle: None,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty means every caller is unauthenticated.
    pub tokens: Vec<String>,
}

/// Which engine serves a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Http,
    Websocket,
}

/// How a route picks its upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Target taken from the `url` query parameter.
    #[default]
    Query,
    /// Fixed upstream base URL plus the request path tail.
    Upstream,
}

/// One proxied route.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Path the route is mounted on (e.g., "/api/proxy").
    pub path: String,

    pub kind: RouteKind,

    #[serde(default)]
    pub mode: RouteMode,

    /// Base URL for `upstream` mode.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Forward callers the host did not authenticate.
    #[serde(default)]
    pub allow_unauthenticated: bool,

    /// Extra outbound headers, replacing same-named inbound ones.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Extra trust anchors (PEM) for this route's upstream.
    #[serde(default)]
    pub ca_bundle: Option<String>,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, kind: RouteKind) -> Self {
        Self {
            path: path.into(),
            kind,
            mode: RouteMode::Query,
            upstream: None,
            allow_unauthenticated: false,
            headers: BTreeMap::new(),
            ca_bundle: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set.
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.client.max_body_bytes, 16 * 1024 * 1024);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[1].kind, RouteKind::Websocket);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn parses_routes() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [auth]
            tokens = ["secret"]

            [[routes]]
            path = "/camera"
            kind = "http"
            mode = "upstream"
            upstream = "https://10.0.0.9/snapshot"
            allow_unauthenticated = true
            ca_bundle = "/etc/web-proxy/camera.pem"

            [routes.headers]
            x-api-key = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.routes.len(), 1);
        let route = &config.routes[0];
        assert_eq!(route.mode, RouteMode::Upstream);
        assert_eq!(route.upstream.as_deref(), Some("https://10.0.0.9/snapshot"));
        assert!(route.allow_unauthenticated);
        assert_eq!(route.headers.get("x-api-key").map(String::as_str), Some("abc"));
        assert_eq!(config.auth.tokens, vec!["secret"]);
    }

    #[test]
    fn rejects_unknown_route_kind() {
        let result: Result<ProxyConfig, _> = toml::from_str(
            r#"
            [[routes]]
            path = "/x"
            kind = "grpc"
            "#,
        );
        assert!(result.is_err());
    }
}
