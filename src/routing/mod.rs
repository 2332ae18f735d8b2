//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route table compilation (per route list):
//!     Vec<Route>
//!     → matcher.rs (compile every path pattern, surface bad patterns)
//!     → query.rs (compile every query rule list)
//!     → tree.rs (segment trie + out-of-band fallback route)
//!     → RouteTable (immutable, shared via Arc / ArcSwap)
//!
//! Per navigation:
//!     (pathname, query, base_path)
//!     → cache.rs (memoized match, validated against the current table)
//!     → router.rs (trie traversal in specificity order)
//!     → matcher.rs + query.rs (path params, query constraints)
//!     → ResolvedRoute or None
//! ```
//!
//! # Design Decisions
//! - Matching never errors: malformed input resolves to no match
//! - Pattern compilation errors are configuration errors, raised at table build
//! - Deterministic: same table and input always select the same route
//! - No global state; pattern and match caches live on the `Resolver`

pub mod cache;
pub mod matcher;
pub mod query;
pub mod route;
pub mod router;
pub mod tree;

pub use matcher::{match_path, PathOptions, PatternCache};
pub use query::{match_query, QueryRules};
pub use route::{Match, QueryParams, ResolvedRoute, Route, RouterContext};
pub use router::{Resolver, RouteTable, RoutingError, SharedRouteTable};
