//! Header manipulation for proxied requests and responses.
//!
//! # Responsibilities
//! - Strip headers that must not travel to the upstream (hop-specific,
//!   WebSocket negotiation, host, caller credentials)
//! - Add X-Forwarded-For, X-Forwarded-Host, X-Forwarded-Proto
//! - Strip upstream response headers the proxy re-derives itself
//!
//! # Design Decisions
//! - Pure functions over `HeaderMap`: no I/O, no hidden state
//! - Headers supplied by the resolver replace inbound values of the same name
//! - The exclusion lists below are the complete contract; nothing else is
//!   filtered

use std::net::IpAddr;

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Hop recorded in X-Forwarded-For when the caller's address is not known.
pub const UNKNOWN_PEER: &str = "unknown";

/// Inbound request headers never copied to the upstream request.
pub const OUTBOUND_EXCLUDED: [HeaderName; 8] = [
    CONTENT_LENGTH,
    CONTENT_ENCODING,
    SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION,
    SEC_WEBSOCKET_KEY,
    HOST,
    AUTHORIZATION,
];

/// Upstream response headers never copied back to the caller.
pub const RESPONSE_EXCLUDED: [HeaderName; 6] = [
    TRANSFER_ENCODING,
    CONTENT_TYPE,
    CONTENT_ENCODING,
    ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_EXPOSE_HEADERS,
];

/// What the proxy knows about the inbound connection when building
/// forwarding headers.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingContext<'a> {
    /// Address of the directly connected peer, when the transport exposes it.
    pub peer: Option<IpAddr>,
    /// The host the caller addressed (Host header or URI authority).
    pub host: Option<&'a str>,
    /// Scheme the caller used to reach the proxy.
    pub scheme: &'a str,
}

/// Build the header set for the upstream request.
pub fn outbound_headers(
    inbound: &HeaderMap,
    overrides: Option<&HeaderMap>,
    ctx: &ForwardingContext<'_>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 3);
    for (name, value) in inbound {
        if !OUTBOUND_EXCLUDED.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Some(overrides) = overrides {
        for name in overrides.keys() {
            headers.remove(name);
        }
        for (name, value) in overrides {
            headers.append(name.clone(), value.clone());
        }
    }

    let mut chain: Vec<&str> = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    let peer = ctx
        .peer
        .map_or_else(|| UNKNOWN_PEER.to_string(), |peer| peer.to_string());
    chain.push(&peer);
    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let forwarded_host = non_empty(inbound.get(X_FORWARDED_HOST))
        .or_else(|| ctx.host.and_then(|h| HeaderValue::from_str(h).ok()));
    if let Some(value) = forwarded_host {
        headers.insert(X_FORWARDED_HOST, value);
    }

    let forwarded_proto = non_empty(inbound.get(X_FORWARDED_PROTO))
        .or_else(|| HeaderValue::from_str(ctx.scheme).ok());
    if let Some(value) = forwarded_proto {
        headers.insert(X_FORWARDED_PROTO, value);
    }

    headers
}

/// Build the header set returned to the caller from the upstream response.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !RESPONSE_EXCLUDED.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn non_empty(value: Option<&HeaderValue>) -> Option<HeaderValue> {
    value.filter(|v| !v.is_empty()).cloned()
}
