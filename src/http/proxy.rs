//! HTTP proxy engine.
//!
//! # Data Flow
//! ```text
//! Request
//!     → resolver + gate (404 / 401 / mapped resolver error, no upstream call)
//!     → read body (bounded)
//!     → headers::outbound_headers
//!     → one upstream call, redirects off, no retry (502 on failure)
//!     → status + headers::response_headers + streamed body
//! ```
//!
//! Once the response head has been returned, an upstream failure can only end
//! the body early.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::TryStreamExt;

use crate::http::request::{route_params, ProxyRequest};
use crate::net::client::{redact, UpstreamClient, UpstreamError};
use crate::observability::metrics;
use crate::routing::resolver::{authorize, ResolvedTarget, Resolver};
use crate::security::headers::{outbound_headers, response_headers};

const KIND: &str = "http";

/// Settings shared by both engines.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Largest inbound request body read before forwarding.
    pub max_body_bytes: usize,
    /// Scheme reported in X-Forwarded-Proto when the request URI has none.
    pub inbound_scheme: &'static str,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
            inbound_scheme: "http",
        }
    }
}

/// Streams one inbound HTTP request to the target picked by its resolver.
///
/// Serve the router with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the caller's address lands in `X-Forwarded-For`; otherwise the hop is
/// recorded as `unknown`.
#[derive(Clone)]
pub struct HttpProxy {
    resolver: Arc<dyn Resolver>,
    client: UpstreamClient,
    settings: EngineSettings,
}

impl HttpProxy {
    pub fn new(resolver: Arc<dyn Resolver>, client: UpstreamClient) -> Self {
        Self {
            resolver,
            client,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Router serving this engine on `path` for every method.
    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, any(proxy_handler))
            .with_state(self)
    }

    pub async fn handle(&self, request: Request<Body>) -> Response {
        let start = Instant::now();
        let (mut parts, body) = request.into_parts();
        let params = route_params(&mut parts).await;
        let request = ProxyRequest::new(&parts).with_params(params);

        let target = match authorize(self.resolver.as_ref(), &request) {
            Ok(target) => target,
            Err(status) => {
                metrics::record_request(KIND, status.as_u16(), start);
                return status.into_response();
            }
        };

        let body = match to_bytes(body, self.settings.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    limit = self.settings.max_body_bytes,
                    error = %e,
                    "Failed to read request body"
                );
                metrics::record_request(KIND, 413, start);
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let headers = outbound_headers(
            &parts.headers,
            target.headers.as_ref(),
            &request.forwarding(self.settings.inbound_scheme),
        );

        tracing::debug!(
            method = %parts.method,
            target = %redact(&target.url),
            "Proxying request"
        );

        let upstream = match self.forward(parts.method.clone(), &target, headers, body).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    target = %redact(&target.url),
                    error = %e,
                    "Reverse proxy error"
                );
                metrics::record_upstream_error(KIND);
                metrics::record_request(KIND, 502, start);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        metrics::record_request(KIND, upstream.status().as_u16(), start);
        stream_response(upstream, redact(&target.url))
    }

    async fn forward(
        &self,
        method: Method,
        target: &ResolvedTarget,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = target.upstream_url()?;
        let client = self.client.http(target.tls.as_ref())?;
        client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(UpstreamError::Request)
    }
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .finish()
    }
}

async fn proxy_handler(State(proxy): State<HttpProxy>, request: Request<Body>) -> Response {
    proxy.handle(request).await
}

/// Start the caller's response from the upstream head and stream the body
/// through as chunks arrive.
fn stream_response(upstream: reqwest::Response, target: String) -> Response {
    let status = upstream.status();
    let mut headers = response_headers(upstream.headers());
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_TYPE, content_type);

    let stream = upstream.bytes_stream().inspect_err(move |e| {
        tracing::debug!(target = %target, error = %e, "Upstream stream ended early");
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
