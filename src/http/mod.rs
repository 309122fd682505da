//! HTTP and WebSocket proxy engines.
//!
//! # Data Flow
//! ```text
//! Inbound request (host router, auth flag attached)
//!     → request.rs (read-only view for resolvers)
//!     → routing::authorize (resolver + gate)
//!     → proxy.rs     (HTTP: one upstream call, streamed response)
//!       websocket.rs (upgrade, upstream socket, two relays)
//! ```
//!
//! `server.rs` is the reference host: it builds one engine per configured
//! route and serves them.

pub mod proxy;
pub mod request;
pub mod server;
pub mod websocket;

pub use proxy::{EngineSettings, HttpProxy};
pub use request::ProxyRequest;
pub use server::{HttpServer, ServerError};
pub use websocket::WebSocketProxy;
