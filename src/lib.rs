//! Embeddable reverse-proxy engine.
//!
//! A host application mounts [`HttpProxy`] and [`WebSocketProxy`] engines on
//! its own routes. Each engine asks a route-specific [`Resolver`] where the
//! request should go, applies the authentication gate, rewrites headers and
//! then streams the exchange to the upstream.
//!
//! ```text
//!     Client ──▶ host router ──▶ engine ──▶ Resolver ──▶ ResolvedTarget
//!                                  │
//!                                  ├── headers (outbound / response filters)
//!                                  ├── net::client (pooled reqwest, per-call TLS)
//!                                  └── net::frame (raw WebSocket frame relay)
//! ```
//!
//! The `web-proxy` binary is a reference host driven by a TOML config.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::{EngineSettings, HttpProxy, HttpServer, ProxyRequest, WebSocketProxy};
pub use lifecycle::Shutdown;
pub use net::{ClientSettings, TlsContext, UpstreamClient, UpstreamError};
pub use routing::{QueryUrlResolver, ResolvedTarget, Resolver, ResolverError, UpstreamResolver};
pub use security::{Authenticated, TokenAuth};
