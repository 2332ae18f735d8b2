//! Memoized route resolution.
//!
//! # Design Decisions
//! - Keyed by (pathname, decoded query map, base path)
//! - Bounded LRU; misses are cheap to recompute
//! - A hit is only trusted if its route is still part of the table being
//!   resolved against; stale entries are dropped on sight

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::routing::route::{Match, QueryParams, ResolvedRoute, Route};
use crate::routing::router::RouteTable;

/// Default number of memoized resolutions.
pub const DEFAULT_MATCH_CACHE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey {
    pathname: String,
    query: QueryParams,
    base_path: String,
}

impl MatchKey {
    fn new(pathname: &str, query: &QueryParams, base_path: &str) -> Self {
        Self {
            pathname: pathname.to_string(),
            query: query.clone(),
            base_path: base_path.to_string(),
        }
    }
}

/// Small bounded cache of the last resolutions.
#[derive(Debug)]
pub struct MatchCache {
    entries: Mutex<LruCache<MatchKey, (Arc<Route>, Match)>>,
}

impl MatchCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached resolution for the key, if its route still belongs to `table`.
    pub fn get(
        &self,
        table: &RouteTable,
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
    ) -> Option<ResolvedRoute> {
        let key = MatchKey::new(pathname, query, base_path);
        let mut entries = self.entries.lock().expect("match cache mutex poisoned");

        let (route, matched) = entries.get(&key)?;
        if !table.contains(route) {
            tracing::debug!(pathname, route = %route.label(), "Discarding cached match for replaced route");
            entries.pop(&key);
            return None;
        }

        Some(ResolvedRoute {
            route: Arc::clone(route),
            matched: matched.clone(),
        })
    }

    pub fn insert(
        &self,
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
        resolved: &ResolvedRoute,
    ) {
        let key = MatchKey::new(pathname, query, base_path);
        self.entries
            .lock()
            .expect("match cache mutex poisoned")
            .put(key, (Arc::clone(&resolved.route), resolved.matched.clone()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("match cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("match cache mutex poisoned").clear();
    }
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_CACHE_SIZE)
    }
}
