//! Route descriptors and match results.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::config::schema::RouteConfig;
use crate::resources::ResourceSet;

/// A declared route.
///
/// Routes are immutable once handed to a [`RouteTable`](super::RouteTable).
/// A route whose path is empty or `*` is the fallback route.
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Unique route name, used for lookups and logging.
    pub name: Option<String>,

    /// Path pattern (`/users/:id`, `/files/:path*`, `/posts/:id(\d+)`).
    pub path: String,

    /// Require the pattern to consume the whole pathname.
    pub exact: bool,

    /// Query constraint rules (`tab=(a|b)`, `debug?`, `mode!=legacy`).
    pub query: Vec<String>,

    /// Data resources loaded when this route is entered.
    pub resources: ResourceSet,
}

impl Route {
    /// Create a non-exact route for a path pattern.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create the fallback route.
    pub fn fallback() -> Self {
        Self::new("*")
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    pub fn with_query<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: ResourceSet) -> Self {
        self.resources = resources;
        self
    }

    /// Whether this is the catch-all fallback route.
    pub fn is_fallback(&self) -> bool {
        self.path.is_empty() || self.path == "*"
    }

    /// Name for logs: the route name, or its path when unnamed.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

impl From<&RouteConfig> for Route {
    fn from(config: &RouteConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            exact: config.exact,
            query: config.query.clone(),
            resources: ResourceSet::default(),
        }
    }
}

/// The result of matching a pathname against a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// The route pattern that matched.
    pub path: String,
    /// The portion of the pathname the pattern consumed.
    pub url: String,
    /// Whether `url` is the entire pathname.
    pub is_exact: bool,
    /// Named (or positional) path parameters.
    pub params: BTreeMap<String, String>,
    /// Decoded query values selected by the route's query rules.
    pub query: BTreeMap<String, String>,
}

/// Raw query string parameters.
///
/// Keys are decoded on parse; values are kept encoded so query rules can
/// reject malformed escapes instead of silently accepting them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a query string, with or without the leading `?`.
    /// A key without `=` maps to the empty string; repeated keys keep the last value.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let key = percent_decode_str(&key.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned();
                (key, value.to_string())
            })
            .collect();
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical `k=v&k=v` form, keys sorted.
    pub fn to_query_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<HashMap<String, String>> for QueryParams {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// A route selected by the resolver together with its match.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route: Arc<Route>,
    pub matched: Match,
}

/// Everything known about the current location: the route, its match and
/// the full query. Resource keys and fetches are computed from this.
#[derive(Debug, Clone)]
pub struct RouterContext {
    pub route: Arc<Route>,
    pub matched: Match,
    pub query: QueryParams,
}

impl RouterContext {
    pub fn new(resolved: ResolvedRoute, query: QueryParams) -> Self {
        Self {
            route: resolved.route,
            matched: resolved.matched,
            query,
        }
    }

    /// A path parameter of the current match.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.matched.params.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parse() {
        let query = QueryParams::parse("?foo=bar&flag&a%20b=x%20y&foo=baz");
        assert_eq!(query.get("foo"), Some("baz"));
        assert_eq!(query.get("flag"), Some(""));
        // Keys decoded, values left encoded
        assert_eq!(query.get("a b"), Some("x%20y"));
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn test_query_canonical_string() {
        let a = QueryParams::parse("b=2&a=1");
        let b: QueryParams = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.to_query_string(), "a=1&b=2");
        assert_eq!(QueryParams::parse("").to_query_string(), "");
    }

    #[test]
    fn test_fallback_detection() {
        assert!(Route::new("").is_fallback());
        assert!(Route::fallback().is_fallback());
        assert!(!Route::new("/").is_fallback());
        assert_eq!(Route::new("/a").named("home").label(), "home");
        assert_eq!(Route::new("/a").label(), "/a");
    }
}
