//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check route paths are mountable and unique
//! - Check upstream URLs, header tables and TLS file paths
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//!   (file checks only test for existence)
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use axum::http::{HeaderName, HeaderValue};
use url::Url;

use crate::config::schema::{ProxyConfig, RouteConfig, RouteMode};

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted location of the offending field (e.g., "routes[1].upstream").
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration, reporting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid socket address '{}'", config.listener.bind_address),
        ));
    }
    if let Some(tls) = &config.listener.tls {
        check_file(&mut errors, "listener.tls.cert_path", &tls.cert_path);
        check_file(&mut errors, "listener.tls.key_path", &tls.key_path);
    }

    if let Some(bundle) = &config.client.ca_bundle {
        check_file(&mut errors, "client.ca_bundle", bundle);
    }
    if config.client.max_body_bytes == 0 {
        errors.push(ValidationError::new("client.max_body_bytes", "must be greater than 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", config.observability.metrics_address),
        ));
    }

    let mut paths = HashSet::new();
    for (i, route) in config.routes.iter().enumerate() {
        if !paths.insert(route.path.as_str()) {
            errors.push(ValidationError::new(
                format!("routes[{i}].path"),
                format!("duplicate route path '{}'", route.path),
            ));
        }
        validate_route(&mut errors, i, route);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_route(errors: &mut Vec<ValidationError>, i: usize, route: &RouteConfig) {
    let field = |name: &str| format!("routes[{i}].{name}");

    if !route.path.starts_with('/') || route.path.contains(['{', '}', '*']) {
        errors.push(ValidationError::new(
            field("path"),
            format!("'{}' must start with '/' and contain no captures", route.path),
        ));
    }

    match (route.mode, &route.upstream) {
        (RouteMode::Upstream, None) => {
            errors.push(ValidationError::new(field("upstream"), "required in upstream mode"));
        }
        (RouteMode::Upstream, Some(upstream)) => match Url::parse(upstream) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "ws" | "wss") && url.has_host() => {}
            Ok(_) => errors.push(ValidationError::new(
                field("upstream"),
                format!("'{upstream}' must be an absolute http(s) or ws(s) URL"),
            )),
            Err(e) => errors.push(ValidationError::new(
                field("upstream"),
                format!("'{upstream}': {e}"),
            )),
        },
        (RouteMode::Query, Some(_)) => {
            errors.push(ValidationError::new(field("upstream"), "not used in query mode"));
        }
        (RouteMode::Query, None) => {}
    }

    for (name, value) in &route.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                field("headers"),
                format!("invalid header name '{name}'"),
            ));
        }
        if HeaderValue::from_str(value).is_err() {
            errors.push(ValidationError::new(
                field("headers"),
                format!("invalid value for header '{name}'"),
            ));
        }
    }

    if let Some(bundle) = &route.ca_bundle {
        check_file(errors, &field("ca_bundle"), bundle);
    }
}

fn check_file(errors: &mut Vec<ValidationError>, field: &str, path: &str) {
    if !Path::new(path).is_file() {
        errors.push(ValidationError::new(field, format!("file not found: {path}")));
    }
}
