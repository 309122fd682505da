//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Resolved target
//!     → tls.rs (per-call TlsContext, or the shared default)
//!     → client.rs (pooled HTTP client for that context, also used for upgrades)
//!     → frame.rs  (raw frame codec once a WebSocket leg is upgraded)
//!     → Upstream connection
//! ```
//!
//! # Design Decisions
//! - One pooled client shared by all sessions; safe for concurrent use
//! - TLS trust is decided per call by the resolver, never by the caller
//! - No retries and no engine-level timeouts beyond connect timeout

pub mod client;
pub mod frame;
pub mod tls;

pub use client::{redact, ClientSettings, UpstreamClient, UpstreamError};
pub use frame::{FrameCodec, FrameError};
pub use tls::{TlsContext, TlsError};
