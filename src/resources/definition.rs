//! Resource definitions and per-route resource sets.
//!
//! # Design Decisions
//! - A definition is immutable and shared (`Arc`) between routes
//! - The dependency graph is validated once, when a `ResourceSet` is built;
//!   fan-out at runtime walks a precomputed adjacency list

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use thiserror::Error;

use crate::resources::slice::{ResourceError, ResourceSlice};
use crate::routing::{Match, QueryParams, Route, RouterContext};

/// Max age for data that never expires.
pub const MAX_AGE_INFINITE: Duration = Duration::MAX;

/// Default number of keys retained per resource type.
pub const DEFAULT_MAX_CACHE: usize = usize::MAX;

pub type KeyFn = Arc<dyn Fn(&RouterContext, &Value) -> String + Send + Sync>;
pub type DataFuture = BoxFuture<'static, Result<Value, ResourceError>>;
pub type DataFn = Arc<dyn Fn(ResourceFetchContext, Value) -> DataFuture + Send + Sync>;

/// Invalid resource declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceConfigError {
    #[error("Duplicate resource type: {resource_type}")]
    DuplicateType { resource_type: String },

    #[error("Resource {resource_type} depends on undeclared type {dependency}")]
    MissingDependency {
        resource_type: String,
        dependency: String,
    },

    #[error("Resource dependency cycle between: {}", .types.join(", "))]
    DependencyCycle { types: Vec<String> },
}

/// Everything a data function sees when it is called.
#[derive(Debug, Clone)]
pub struct ResourceFetchContext {
    pub route: Arc<Route>,
    pub matched: Match,
    pub query: QueryParams,
    pub is_prefetch: bool,
    /// Slices of the resource types this resource depends on.
    pub dependencies: HashMap<String, ResourceSlice>,
}

impl ResourceFetchContext {
    pub(crate) fn new(ctx: &RouterContext, is_prefetch: bool, dependencies: HashMap<String, ResourceSlice>) -> Self {
        Self {
            route: Arc::clone(&ctx.route),
            matched: ctx.matched.clone(),
            query: ctx.query.clone(),
            is_prefetch,
            dependencies,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.matched.params.get(name).map(String::as_str)
    }

    /// Loaded data of a dependency, if any.
    pub fn dependency_data(&self, resource_type: &str) -> Option<&Value> {
        self.dependencies.get(resource_type)?.data.as_ref()
    }
}

/// A fetchable unit of route data.
pub struct ResourceDefinition {
    resource_type: String,
    get_key: KeyFn,
    get_data: DataFn,
    max_age: Duration,
    max_cache: usize,
    browser_only: bool,
    depends: Vec<String>,
}

impl ResourceDefinition {
    /// Define a resource with an async data function.
    pub fn new<K, D, Fut>(resource_type: impl Into<String>, get_key: K, get_data: D) -> Self
    where
        K: Fn(&RouterContext, &Value) -> String + Send + Sync + 'static,
        D: Fn(ResourceFetchContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResourceError>> + Send + 'static,
    {
        Self {
            resource_type: resource_type.into(),
            get_key: Arc::new(get_key),
            get_data: Arc::new(move |ctx, custom| get_data(ctx, custom).boxed()),
            max_age: Duration::ZERO,
            max_cache: DEFAULT_MAX_CACHE,
            browser_only: false,
            depends: Vec::new(),
        }
    }

    /// Define a resource whose data is computed synchronously.
    pub fn from_fn<K, D>(resource_type: impl Into<String>, get_key: K, get_data: D) -> Self
    where
        K: Fn(&RouterContext, &Value) -> String + Send + Sync + 'static,
        D: Fn(&ResourceFetchContext, &Value) -> Result<Value, ResourceError> + Send + Sync + 'static,
    {
        Self::new(resource_type, get_key, move |ctx, custom| {
            future::ready(get_data(&ctx, &custom))
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_cache(mut self, max_cache: usize) -> Self {
        self.max_cache = max_cache;
        self
    }

    /// Skip this resource when rendering statically.
    pub fn browser_only(mut self, browser_only: bool) -> Self {
        self.browser_only = browser_only;
        self
    }

    pub fn depends_on<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn max_cache(&self) -> usize {
        self.max_cache
    }

    pub fn is_browser_only(&self) -> bool {
        self.browser_only
    }

    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    /// Cache key for a location.
    pub fn key(&self, ctx: &RouterContext, custom: &Value) -> String {
        (self.get_key)(ctx, custom)
    }

    /// Start the data function.
    pub fn fetch(&self, ctx: ResourceFetchContext, custom: Value) -> DataFuture {
        (self.get_data)(ctx, custom)
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("resource_type", &self.resource_type)
            .field("max_age", &self.max_age)
            .field("max_cache", &self.max_cache)
            .field("browser_only", &self.browser_only)
            .field("depends", &self.depends)
            .finish_non_exhaustive()
    }
}

/// The resources one route declares, with a validated dependency graph.
#[derive(Clone, Default)]
pub struct ResourceSet {
    inner: Arc<ResourceSetInner>,
}

#[derive(Default)]
struct ResourceSetInner {
    resources: Vec<Arc<ResourceDefinition>>,
    /// type → indexes of resources that depend on it directly
    dependents: HashMap<String, Vec<usize>>,
}

impl ResourceSet {
    pub fn new<I>(resources: I) -> Result<Self, ResourceConfigError>
    where
        I: IntoIterator<Item = Arc<ResourceDefinition>>,
    {
        let resources: Vec<Arc<ResourceDefinition>> = resources.into_iter().collect();

        let mut seen = HashSet::new();
        for resource in &resources {
            if !seen.insert(resource.resource_type()) {
                return Err(ResourceConfigError::DuplicateType {
                    resource_type: resource.resource_type().to_string(),
                });
            }
        }

        let mut dependents: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, resource) in resources.iter().enumerate() {
            for dependency in resource.depends() {
                if !seen.contains(dependency.as_str()) {
                    return Err(ResourceConfigError::MissingDependency {
                        resource_type: resource.resource_type().to_string(),
                        dependency: dependency.clone(),
                    });
                }
                dependents.entry(dependency.clone()).or_default().push(index);
            }
        }

        check_acyclic(&resources, &dependents)?;

        Ok(Self {
            inner: Arc::new(ResourceSetInner { resources, dependents }),
        })
    }

    pub fn get(&self, resource_type: &str) -> Option<&Arc<ResourceDefinition>> {
        self.inner
            .resources
            .iter()
            .find(|r| r.resource_type() == resource_type)
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.get(resource_type).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceDefinition>> {
        self.inner.resources.iter()
    }

    pub fn as_slice(&self) -> &[Arc<ResourceDefinition>] {
        &self.inner.resources
    }

    /// Resources whose `depends` names `resource_type`.
    pub fn dependents_of(&self, resource_type: &str) -> Vec<Arc<ResourceDefinition>> {
        self.inner
            .dependents
            .get(resource_type)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| Arc::clone(&self.inner.resources[i]))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every resource reachable through dependents of `resource_type`,
    /// nearest first.
    pub fn transitive_dependents(&self, resource_type: &str) -> Vec<Arc<ResourceDefinition>> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([resource_type.to_string()]);
        let mut found = Vec::new();

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if visited.insert(dependent.resource_type().to_string()) {
                    queue.push_back(dependent.resource_type().to_string());
                    found.push(dependent);
                }
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.inner.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.resources.is_empty()
    }
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.inner.resources.iter().map(|r| r.resource_type()))
            .finish()
    }
}

/// Kahn's algorithm; whatever cannot be ordered sits on a cycle.
fn check_acyclic(
    resources: &[Arc<ResourceDefinition>],
    dependents: &HashMap<String, Vec<usize>>,
) -> Result<(), ResourceConfigError> {
    let mut in_degree: Vec<usize> = resources.iter().map(|r| r.depends().len()).collect();
    let mut ready: VecDeque<usize> = (0..resources.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = 0;

    while let Some(index) = ready.pop_front() {
        ordered += 1;
        for &dependent in dependents.get(resources[index].resource_type()).into_iter().flatten() {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if ordered == resources.len() {
        return Ok(());
    }

    let mut types: Vec<String> = (0..resources.len())
        .filter(|&i| in_degree[i] > 0)
        .map(|i| resources[i].resource_type().to_string())
        .collect();
    types.sort();
    Err(ResourceConfigError::DependencyCycle { types })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(resource_type: &str, depends: &[&str]) -> Arc<ResourceDefinition> {
        Arc::new(
            ResourceDefinition::from_fn(
                resource_type,
                |_, _| "key".to_string(),
                |_, _| Ok(Value::Null),
            )
            .depends_on(depends.iter().copied()),
        )
    }

    #[test]
    fn test_defaults() {
        let def = resource("user", &[]);
        assert_eq!(def.max_age(), Duration::ZERO);
        assert_eq!(def.max_cache(), DEFAULT_MAX_CACHE);
        assert!(!def.is_browser_only());
    }

    #[test]
    fn test_dependents() {
        let set = ResourceSet::new([
            resource("a", &[]),
            resource("b", &["a"]),
            resource("c", &["b"]),
            resource("d", &["a"]),
        ])
        .unwrap();

        let direct: Vec<String> = set
            .dependents_of("a")
            .iter()
            .map(|r| r.resource_type().to_string())
            .collect();
        assert_eq!(direct, vec!["b", "d"]);

        let all: Vec<String> = set
            .transitive_dependents("a")
            .iter()
            .map(|r| r.resource_type().to_string())
            .collect();
        assert_eq!(all, vec!["b", "d", "c"]);
        assert!(set.dependents_of("c").is_empty());
    }

    #[test]
    fn test_duplicate_type() {
        let err = ResourceSet::new([resource("a", &[]), resource("a", &[])]).unwrap_err();
        assert_eq!(
            err,
            ResourceConfigError::DuplicateType {
                resource_type: "a".to_string()
            }
        );
    }

    #[test]
    fn test_missing_dependency() {
        let err = ResourceSet::new([resource("b", &["a"])]).unwrap_err();
        assert!(matches!(err, ResourceConfigError::MissingDependency { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let err = ResourceSet::new([
            resource("a", &["c"]),
            resource("b", &["a"]),
            resource("c", &["b"]),
            resource("free", &[]),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Resource dependency cycle between: a, b, c"
        );

        let err = ResourceSet::new([resource("self", &["self"])]).unwrap_err();
        assert!(matches!(err, ResourceConfigError::DependencyCycle { .. }));
    }
}
