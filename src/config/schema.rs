//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::routing::cache::DEFAULT_MATCH_CACHE_SIZE;
use crate::routing::matcher::PATTERN_CACHE_LIMIT;
use crate::routing::router::MAX_TRAVERSAL_ITERATIONS;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Prefix every pathname is expected to start with (e.g. "/app").
    pub base_path: String,

    /// Resolver caches and traversal limits.
    pub resolver: ResolverConfig,

    /// Resource store settings.
    pub resources: ResourcesConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Route declarations, in priority order for equal specificity.
    pub routes: Vec<RouteConfig>,
}

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Memoized resolutions kept (LRU).
    pub match_cache_size: usize,

    /// Compiled path patterns kept before compiling without caching.
    pub pattern_cache_limit: usize,

    /// Trie nodes visited per resolution before giving up.
    pub max_iterations: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            match_cache_size: DEFAULT_MATCH_CACHE_SIZE,
            pattern_cache_limit: PATTERN_CACHE_LIMIT,
            max_iterations: MAX_TRAVERSAL_ITERATIONS,
        }
    }
}

/// Resource store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Default fetch timeout; unset means wait indefinitely.
    pub timeout_ms: Option<u64>,

    /// How long a prefetched slice may wait to be promoted.
    pub prefetch_max_age_ms: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            prefetch_max_age_ms: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A declared route.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging and lookups.
    #[serde(default)]
    pub name: Option<String>,

    /// Path pattern; empty or "*" declares the fallback route.
    #[serde(default)]
    pub path: String,

    /// Require the whole pathname to match.
    #[serde(default)]
    pub exact: bool,

    /// Query constraint rules.
    #[serde(default)]
    pub query: Vec<String>,
}
