//! HTTP server setup for the reference host.
//!
//! # Responsibilities
//! - Build one proxy engine per configured route
//! - Wire up middleware (auth flag, request ID, tracing)
//! - Bind the router to a plain or TLS listener
//! - Stop accepting on shutdown and drain in-flight requests

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use url::Url;

use crate::config::schema::{ProxyConfig, RouteConfig, RouteKind, RouteMode};
use crate::http::proxy::{EngineSettings, HttpProxy};
use crate::http::websocket::WebSocketProxy;
use crate::lifecycle::Shutdown;
use crate::net::client::UpstreamClient;
use crate::net::tls::{TlsContext, TlsError};
use crate::routing::upstream::TAIL_PARAM;
use crate::routing::{QueryUrlResolver, Resolver, UpstreamResolver};
use crate::security::auth::{authenticate, TokenAuth};

/// How long open connections may drain after shutdown on the TLS listener.
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while building routes from configuration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("route {path}: invalid upstream: {source}")]
    InvalidUpstream {
        path: String,
        #[source]
        source: url::ParseError,
    },

    #[error("route {path}: upstream mode requires an upstream URL")]
    MissingUpstream { path: String },

    #[error("route {path}: invalid header '{name}'")]
    InvalidHeader { path: String, name: String },

    #[error("route {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: TlsError,
    },
}

/// HTTP server for the proxy host.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Build the server from configuration.
    pub fn new(
        config: &ProxyConfig,
        client: UpstreamClient,
        auth: TokenAuth,
    ) -> Result<Self, ServerError> {
        let settings = EngineSettings {
            max_body_bytes: config.client.max_body_bytes,
            inbound_scheme: if config.listener.tls.is_some() { "https" } else { "http" },
        };

        let mut routes = Router::new();
        for route in &config.routes {
            let resolver = resolver_for(route)?;
            for path in mount_paths(route) {
                let router = match route.kind {
                    RouteKind::Http => HttpProxy::new(Arc::clone(&resolver), client.clone())
                        .with_settings(settings.clone())
                        .into_router(&path),
                    RouteKind::Websocket => {
                        WebSocketProxy::new(Arc::clone(&resolver), client.clone())
                            .with_settings(settings.clone())
                            .into_router(&path)
                    }
                };
                routes = routes.merge(router);
            }
            tracing::info!(
                path = %route.path,
                kind = ?route.kind,
                mode = ?route.mode,
                allow_unauthenticated = route.allow_unauthenticated,
                "Route registered"
            );
        }

        Ok(Self {
            router: Self::build_router(routes, auth),
        })
    }

    /// Wrap the proxy routes with the host middleware.
    fn build_router(routes: Router, auth: TokenAuth) -> Router {
        routes
            .layer(middleware::from_fn_with_state(auth, authenticate))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve plain HTTP until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` until `shutdown` fires.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: Shutdown,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        let stop = shutdown.wait();
        tokio::spawn(async move {
            stop.await;
            drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Resolver for one configured route.
pub fn resolver_for(route: &RouteConfig) -> Result<Arc<dyn Resolver>, ServerError> {
    let headers = header_map(&route.path, &route.headers)?;
    let tls = match &route.ca_bundle {
        Some(bundle) => Some(TlsContext::with_ca_bundle(Path::new(bundle)).map_err(|source| {
            ServerError::Tls {
                path: route.path.clone(),
                source,
            }
        })?),
        None => None,
    };

    let resolver: Arc<dyn Resolver> = match route.mode {
        RouteMode::Query => {
            let mut resolver = QueryUrlResolver::new().allow_unauthenticated(route.allow_unauthenticated);
            if let Some(headers) = headers {
                resolver = resolver.with_headers(headers);
            }
            if let Some(tls) = tls {
                resolver = resolver.with_tls(tls);
            }
            Arc::new(resolver)
        }
        RouteMode::Upstream => {
            let upstream = route.upstream.as_deref().ok_or_else(|| ServerError::MissingUpstream {
                path: route.path.clone(),
            })?;
            let base = Url::parse(upstream).map_err(|source| ServerError::InvalidUpstream {
                path: route.path.clone(),
                source,
            })?;
            let mut resolver =
                UpstreamResolver::new(base).allow_unauthenticated(route.allow_unauthenticated);
            if let Some(headers) = headers {
                resolver = resolver.with_headers(headers);
            }
            if let Some(tls) = tls {
                resolver = resolver.with_tls(tls);
            }
            Arc::new(resolver)
        }
    };
    Ok(resolver)
}

/// Paths a route is mounted on. Upstream routes also take a path tail.
fn mount_paths(route: &RouteConfig) -> Vec<String> {
    match route.mode {
        RouteMode::Query => vec![route.path.clone()],
        RouteMode::Upstream => {
            let prefix = route.path.trim_end_matches('/');
            let tail = format!("{prefix}/{{*{TAIL_PARAM}}}");
            if prefix.is_empty() {
                vec!["/".to_string(), tail]
            } else {
                vec![prefix.to_string(), tail]
            }
        }
    }
}

fn header_map(
    path: &str,
    headers: &BTreeMap<String, String>,
) -> Result<Option<HeaderMap>, ServerError> {
    if headers.is_empty() {
        return Ok(None);
    }
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let invalid = || ServerError::InvalidHeader {
            path: path.to_string(),
            name: name.clone(),
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        map.insert(name, value);
    }
    Ok(Some(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    use crate::net::client::ClientSettings;

    fn client() -> UpstreamClient {
        UpstreamClient::new(TlsContext::platform_default().unwrap(), ClientSettings::default()).unwrap()
    }

    #[test]
    fn upstream_routes_mount_a_tail() {
        let mut route = RouteConfig::new("/files/", RouteKind::Http);
        route.mode = RouteMode::Upstream;
        assert_eq!(mount_paths(&route), vec!["/files", "/files/{*path}"]);

        route.path = "/".into();
        assert_eq!(mount_paths(&route), vec!["/", "/{*path}"]);

        let query = RouteConfig::new("/api/proxy", RouteKind::Http);
        assert_eq!(mount_paths(&query), vec!["/api/proxy"]);
    }

    #[test]
    fn route_headers_are_validated() {
        let mut route = RouteConfig::new("/api/proxy", RouteKind::Http);
        route.headers.insert("x-api-key".into(), "abc".into());
        assert!(resolver_for(&route).is_ok());

        route.headers.insert("bad header".into(), "abc".into());
        assert!(matches!(
            resolver_for(&route),
            Err(ServerError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn upstream_mode_needs_a_url() {
        let mut route = RouteConfig::new("/cams", RouteKind::Http);
        route.mode = RouteMode::Upstream;
        assert!(matches!(
            resolver_for(&route),
            Err(ServerError::MissingUpstream { .. })
        ));
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected_with_request_id() {
        let server = HttpServer::new(&ProxyConfig::default(), client(), TokenAuth::new(vec!["t".to_string()])).unwrap();
        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/proxy?url=http%3A%2F%2F127.0.0.1%3A1%2F")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let server = HttpServer::new(&ProxyConfig::default(), client(), TokenAuth::new(vec!["t".to_string()])).unwrap();
        let response = server
            .router()
            .oneshot(Request::builder().uri("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
