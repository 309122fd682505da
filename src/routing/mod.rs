//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, uri, headers, route params, auth flag)
//!     → resolver.rs (route-specific Resolver::resolve)
//!     → authorize(): error mapping, empty-target and auth gate
//!     → Return: ResolvedTarget or a status code
//!
//! Resolvers shipped with the crate:
//!     query.rs    : target taken from `?url=`
//!     upstream.rs : target is a configured base URL + path tail
//! ```
//!
//! # Design Decisions
//! - All routing policy lives in resolvers; the engines only enforce the gate
//! - Resolvers are immutable after construction (thread-safe without locks)
//! - Deterministic: same request always resolves to the same target

pub mod query;
pub mod resolver;
pub mod upstream;

pub use query::QueryUrlResolver;
pub use resolver::{authorize, ResolvedTarget, Resolver, ResolverError};
pub use upstream::UpstreamResolver;
