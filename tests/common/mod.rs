//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    http::HeaderMap,
    middleware::{self, Next},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use web_proxy::{
    Authenticated, ClientSettings, ProxyRequest, ResolvedTarget, Resolver, ResolverError,
    TlsContext, UpstreamClient,
};

pub const TOKEN: &str = "test-token";

/// Serve `router` on an ephemeral port, returning its address.
pub async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Serve a proxy router with connect info on an ephemeral port.
pub async fn spawn_proxy(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn upstream_client() -> UpstreamClient {
    UpstreamClient::new(TlsContext::platform_default().unwrap(), ClientSettings::default()).unwrap()
}

/// Test-side HTTP client: no proxies, no redirects.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Mark every request as authenticated (or not) the way a host would.
pub fn with_auth_flag(router: Router, authenticated: bool) -> Router {
    router.layer(middleware::from_fn(move |mut request: Request<Body>, next: Next| async move {
        request.extensions_mut().insert(Authenticated(authenticated));
        next.run(request).await
    }))
}

/// Resolver returning a fixed outcome, counting its calls.
#[derive(Debug)]
pub struct FixedResolver {
    outcome: Result<ResolvedTarget, ResolverError>,
    calls: AtomicUsize,
}

impl FixedResolver {
    pub fn ok(target: ResolvedTarget) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(target),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn err(error: ResolverError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(error),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver for FixedResolver {
    fn resolve(&self, _request: &ProxyRequest<'_>) -> Result<ResolvedTarget, ResolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// What an upstream mock saw.
#[derive(Debug, Clone, Default)]
pub struct Seen {
    pub hits: Arc<AtomicUsize>,
    pub last: Arc<Mutex<Option<SeenRequest>>>,
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Seen {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn last(&self) -> SeenRequest {
        self.last.lock().await.clone().expect("upstream was not called")
    }

    /// Record the request, then hand it back for the handler to answer.
    pub async fn record(&self, request: Request<Body>) -> SeenRequest {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let seen = SeenRequest {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body: body.to_vec(),
        };
        *self.last.lock().await = Some(seen.clone());
        seen
    }
}
