//! Route tables and resolution.
//!
//! # Responsibilities
//! - Validate and compile a route list into an immutable `RouteTable`
//! - Resolve (pathname, query, base path) to the single best route
//! - Memoize resolutions and invalidate them when the table changes
//!
//! # Resolution Order
//! 1. Match cache hit whose route is still in the table
//! 2. Route lists of zero or one route are matched directly
//! 3. Breadth-first trie walk: the first route at the pathname's own depth
//!    that matches path and query wins, as does a non-exact route on a leaf
//!    with segments left over; other prefix matches found on the way are
//!    kept as deferred candidates (deepest first)
//! 4. The fallback route

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::config::schema::ResolverConfig;
use crate::observability::metrics;
use crate::routing::cache::MatchCache;
use crate::routing::matcher::{match_path, normalize_base, CompileOptions, PathOptions, PatternCache};
use crate::routing::query::QueryRules;
use crate::routing::route::{Match, QueryParams, ResolvedRoute, Route, RouterContext};
use crate::routing::tree::{split_segments, NodeId, Tree, ROOT};

/// Hard ceiling on trie nodes visited per resolution.
pub const MAX_TRAVERSAL_ITERATIONS: usize = 2_000;

/// Route configuration errors, raised when a table is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// More than one route uses an empty or `*` path.
    #[error("Duplicate fallback routes: {first} and {second}")]
    DuplicateFallback { first: String, second: String },

    /// A path pattern failed to compile.
    #[error("Invalid path pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A query rule has no name or an invalid regex value.
    #[error("Invalid query rule {rule:?}: {reason}")]
    InvalidQueryRule { rule: String, reason: String },
}

/// A validated route list and its trie.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    query_rules: Vec<QueryRules>,
    tree: Tree,
}

impl RouteTable {
    /// Validate and index a route list.
    pub fn build(routes: Vec<Route>, patterns: &PatternCache) -> Result<Self, RoutingError> {
        Self::from_shared(routes.into_iter().map(Arc::new).collect(), patterns)
    }

    /// Like [`build`](Self::build) for routes already shared elsewhere.
    pub fn from_shared(routes: Vec<Arc<Route>>, patterns: &PatternCache) -> Result<Self, RoutingError> {
        let mut query_rules = Vec::with_capacity(routes.len());
        for route in &routes {
            if !route.is_fallback() && route.path != "/" {
                let options = CompileOptions {
                    end: route.exact,
                    ..CompileOptions::default()
                };
                patterns.compile(&route.path, options)?;
            }
            query_rules.push(QueryRules::compile(&route.query)?);
        }

        let tree = Tree::build(&routes)?;
        tracing::debug!(routes = routes.len(), nodes = tree.len(), "Route table built");

        Ok(Self {
            routes,
            query_rules,
            tree,
        })
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Whether this exact route object belongs to the table.
    pub fn contains(&self, route: &Arc<Route>) -> bool {
        self.routes.iter().any(|r| Arc::ptr_eq(r, route))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.name.as_deref() == Some(name))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A route table that can be swapped atomically while readers hold the old one.
#[derive(Debug)]
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Snapshot of the current table.
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn replace(&self, table: RouteTable) {
        self.current.store(Arc::new(table));
    }
}

/// Resolves locations against route tables.
///
/// Owns the compiled-pattern cache and the match cache; one resolver is
/// typically shared by every table an application builds.
#[derive(Debug)]
pub struct Resolver {
    patterns: PatternCache,
    matches: MatchCache,
    max_iterations: usize,
}

impl Resolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            patterns: PatternCache::with_limit(config.pattern_cache_limit),
            matches: MatchCache::new(config.match_cache_size),
            max_iterations: config.max_iterations,
        }
    }

    /// Build a table using this resolver's pattern cache.
    pub fn table(&self, routes: Vec<Route>) -> Result<RouteTable, RoutingError> {
        RouteTable::build(routes, &self.patterns)
    }

    pub fn patterns(&self) -> &PatternCache {
        &self.patterns
    }

    pub fn match_cache(&self) -> &MatchCache {
        &self.matches
    }

    /// Resolve a location to its best route.
    pub fn resolve(
        &self,
        table: &RouteTable,
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
    ) -> Option<ResolvedRoute> {
        if let Some(hit) = self.matches.get(table, pathname, query, base_path) {
            metrics::record_match_cache_hit();
            return Some(hit);
        }

        let resolved = match table.routes() {
            [] => None,
            [route] => self
                .try_match(table, 0, pathname, query, base_path)
                .map(|matched| ResolvedRoute {
                    route: Arc::clone(route),
                    matched,
                }),
            _ => self.find_route(table, pathname, query, base_path),
        };

        match &resolved {
            Some(found) => {
                tracing::debug!(pathname, route = %found.route.label(), "Route resolved");
                self.matches.insert(pathname, query, base_path, found);
                metrics::record_route_resolved("matched");
            }
            None => {
                tracing::debug!(pathname, "No route matched");
                metrics::record_route_resolved("unmatched");
            }
        }
        resolved
    }

    /// Resolve with a raw query string.
    pub fn resolve_str(
        &self,
        table: &RouteTable,
        pathname: &str,
        query: &str,
        base_path: &str,
    ) -> Option<ResolvedRoute> {
        self.resolve(table, pathname, &QueryParams::parse(query), base_path)
    }

    /// Resolve a `pathname?query#fragment` string into a router context.
    pub fn resolve_url(&self, table: &RouteTable, url: &str, base_path: &str) -> Option<RouterContext> {
        let url = url.split_once('#').map_or(url, |(before, _)| before);
        let (pathname, query) = url.split_once('?').unwrap_or((url, ""));
        let pathname = if pathname.is_empty() { "/" } else { pathname };

        let query = QueryParams::parse(query);
        self.resolve(table, pathname, &query, base_path)
            .map(|resolved| RouterContext::new(resolved, query))
    }

    /// Match one table route's path and query rules directly.
    fn try_match(
        &self,
        table: &RouteTable,
        index: usize,
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
    ) -> Option<Match> {
        let route = &table.routes[index];
        let matched = if route.is_fallback() {
            Match {
                path: route.path.clone(),
                url: pathname.to_string(),
                is_exact: false,
                params: BTreeMap::new(),
                query: BTreeMap::new(),
            }
        } else {
            match_path(
                &self.patterns,
                pathname,
                PathOptions {
                    path: &route.path,
                    exact: route.exact,
                    base_path,
                },
            )?
        };
        table.query_rules[index].apply(query, matched)
    }

    fn find_route(
        &self,
        table: &RouteTable,
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
    ) -> Option<ResolvedRoute> {
        let found = strip_base(pathname, normalize_base(base_path)).and_then(|stripped| {
            let segments = split_segments(stripped);
            self.traverse(table, &segments, pathname, query, base_path)
        });

        let (index, matched) = match found {
            Some(found) => found,
            None => {
                let index = table.tree().fallback()?;
                let matched = self.try_match(table, index, pathname, query, base_path)?;
                (index, matched)
            }
        };

        Some(ResolvedRoute {
            route: Arc::clone(&table.routes[index]),
            matched,
        })
    }

    fn traverse(
        &self,
        table: &RouteTable,
        segments: &[&str],
        pathname: &str,
        query: &QueryParams,
        base_path: &str,
    ) -> Option<(usize, Match)> {
        let tree = table.tree();
        let mut queue = VecDeque::from([ROOT]);
        let mut deferred: Option<(usize, usize, Match)> = None;
        let mut iterations = 0usize;

        while let Some(id) = queue.pop_front() {
            iterations += 1;
            if iterations > self.max_iterations {
                tracing::warn!(pathname, iterations, "Route traversal exceeded iteration ceiling");
                return None;
            }
            let node = tree.node(id);

            if segments.len() <= node.level {
                let search = Search {
                    table,
                    pathname,
                    query,
                    base_path,
                };
                if let Some(found) = self.first_match(&search, &node.routes) {
                    return Some(found);
                }
                if let Some(found) = self.search_optional(&search, id, &mut iterations) {
                    return Some(found);
                }
                continue;
            }

            // Segments remain below this node: its routes can only be prefix
            // matches. A leaf's prefix match is final; elsewhere it loses to
            // anything found deeper. Exact routes were rejected by try_match.
            for &index in &node.routes {
                let Some(matched) = self.try_match(table, index, pathname, query, base_path) else {
                    continue;
                };
                if matched.is_exact || node.is_leaf() {
                    return Some((index, matched));
                }
                if deferred.as_ref().map_or(true, |(level, ..)| node.level > *level) {
                    deferred = Some((node.level, index, matched));
                }
            }

            queue.extend(tree.ordered_children(id, segments, &self.patterns));
        }

        deferred.map(|(_, index, matched)| (index, matched))
    }

    /// Descend through children that may match nothing, looking for a route.
    fn search_optional(
        &self,
        search: &Search<'_>,
        id: NodeId,
        iterations: &mut usize,
    ) -> Option<(usize, Match)> {
        let tree = search.table.tree();
        for child in tree.optional_children(id) {
            *iterations += 1;
            if *iterations > self.max_iterations {
                return None;
            }
            if let Some(found) = self.first_match(search, &tree.node(child).routes) {
                return Some(found);
            }
            if let Some(found) = self.search_optional(search, child, iterations) {
                return Some(found);
            }
        }
        None
    }

    fn first_match(&self, search: &Search<'_>, routes: &[usize]) -> Option<(usize, Match)> {
        routes.iter().find_map(|&index| {
            self.try_match(
                search.table,
                index,
                search.pathname,
                search.query,
                search.base_path,
            )
            .map(|matched| (index, matched))
        })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(&ResolverConfig::default())
    }
}

struct Search<'a> {
    table: &'a RouteTable,
    pathname: &'a str,
    query: &'a QueryParams,
    base_path: &'a str,
}

/// Pathname below the base path, if it is under it at all.
fn strip_base<'a>(pathname: &'a str, base_path: &str) -> Option<&'a str> {
    let rest = pathname.strip_prefix(base_path)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}
