//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every route pattern and query rule compiles
//! - Validate value ranges (cache sizes, iteration ceiling, addresses)
//! - Detect duplicate route names and fallback routes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouterConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::RouterConfig;
use crate::routing::matcher::PatternCache;
use crate::routing::{Route, RouteTable};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field (e.g. `routes[2].path`).
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

pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !config.base_path.is_empty() && !config.base_path.starts_with('/') {
        errors.push(ValidationError::new("base_path", "must start with '/'"));
    }

    if config.resolver.match_cache_size == 0 {
        errors.push(ValidationError::new("resolver.match_cache_size", "must be greater than 0"));
    }
    if config.resolver.max_iterations == 0 {
        errors.push(ValidationError::new("resolver.max_iterations", "must be greater than 0"));
    }
    if config.resources.timeout_ms == Some(0) {
        errors.push(ValidationError::new("resources.timeout_ms", "must be greater than 0 when set"));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level {:?}", config.observability.log_level),
        ));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address {:?}", config.observability.metrics_address),
        ));
    }

    validate_routes(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_routes(config: &RouterConfig, errors: &mut Vec<ValidationError>) {
    let patterns = PatternCache::new();
    let mut names = HashSet::new();
    let mut fallback: Option<usize> = None;

    for (index, route_config) in config.routes.iter().enumerate() {
        let route = Route::from(route_config);

        if let Some(name) = &route.name {
            if !names.insert(name.clone()) {
                errors.push(ValidationError::new(
                    format!("routes[{index}].name"),
                    format!("duplicate route name {name:?}"),
                ));
            }
        }

        if route.is_fallback() {
            if let Some(first) = fallback {
                errors.push(ValidationError::new(
                    format!("routes[{index}].path"),
                    format!("second fallback route (first is routes[{first}])"),
                ));
            }
            fallback.get_or_insert(index);
        }

        // Checked one at a time so each error points at its route
        if let Err(e) = RouteTable::build(vec![route], &patterns) {
            errors.push(ValidationError::new(format!("routes[{index}]"), e.to_string()));
        }
    }
}
