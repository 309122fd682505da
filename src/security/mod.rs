//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → auth.rs (host computes the Authenticated flag)
//!     → [resolver + gate decide whether to forward]
//!     → headers.rs (sanitize, add X-Forwarded-*)
//!     → Upstream
//!
//! Upstream response:
//!     → headers.rs (drop transport/CORS headers)
//!     → Caller
//! ```
//!
//! # Design Decisions
//! - The engines only read the auth flag; they never authenticate
//! - Caller credentials (Authorization) never reach the upstream
//! - Header transforms are pure and testable in isolation

pub mod auth;
pub mod headers;

pub use auth::{Authenticated, TokenAuth};
