//! Resource cache store.
//!
//! # Responsibilities
//! - Serve `(type, key)` slices from cache while fresh
//! - Run at most one fetch per key, shared by every caller
//! - Resolve dependencies before a fetch and refetch dependents after one
//! - Bound each type's key count (least recently accessed evicted first)
//! - Snapshot and hydrate server-rendered state
//!
//! # Slice Lifecycle
//! ```text
//! absent → loading (promise) → loaded | errored
//!                            → timed out (error, loading, no promise)
//! timed out → loaded          late result, same generation
//! any       → absent          clear, expiry sweep, eviction
//! ```
//!
//! # Design Decisions
//! - Every transition is one synchronous `modify` on the state container
//! - Each fetch is stamped with a generation from one store-wide counter; a
//!   result is only written while its slice still carries that generation
//! - The commit runs inside the shared promise, so anyone who awaited the
//!   promise observes the committed slice
//! - Dependents record the generations of the slices they were computed
//!   from; fan-out skips dependents that are already current, and a
//!   dependent that committed against a superseded dependency is refetched
//! - Dependencies are read through the same freshness check as any other
//!   request, except generations pinned by the commit that triggered the fetch

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::watch;

use crate::config::schema::ResourcesConfig;
use crate::observability::metrics;
use crate::resilience::timeouts::TimeoutGuard;
use crate::resources::definition::{ResourceDefinition, ResourceFetchContext};
use crate::resources::serialize::{self, HydrationState, SerializedData};
use crate::resources::slice::{expires_at, now_millis, ResourceError, ResourcePromise, ResourceSlice};
use crate::resources::state::{ResourceStoreState, StateContainer};
use crate::routing::RouterContext;

/// How long a prefetched slice waits to be promoted.
pub const DEFAULT_PREFETCH_MAX_AGE: Duration = Duration::from_secs(10);

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetResourceOptions {
    /// Store the result in the prefetch slot.
    pub prefetch: bool,
    /// Give up waiting after this long; falls back to the store default.
    pub timeout: Option<Duration>,
    /// Static (server) render: browser-only resources are skipped.
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Data,
    Prefetch,
}

enum Begin {
    /// Nothing to fetch; hand back this slice.
    Existing(ResourceSlice),
    Started,
}

/// The data a fetch will write, once it settles.
struct Pending<'a> {
    resource_type: &'a str,
    key: &'a str,
    max_cache: usize,
    generation: u64,
    now: u64,
    prefetch_window: u64,
    promise: &'a ResourcePromise,
}

/// Shared handle to the resource cache.
///
/// Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: StateContainer<ResourceStoreState>,
    /// Generation stamps and access ticks.
    ticks: AtomicU64,
    default_timeout: Option<Duration>,
    prefetch_max_age: Duration,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::with_config(&ResourcesConfig::default())
    }

    pub fn with_config(config: &ResourcesConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: StateContainer::default(),
                ticks: AtomicU64::new(0),
                default_timeout: config.timeout_ms.map(Duration::from_millis),
                prefetch_max_age: Duration::from_millis(config.prefetch_max_age_ms),
            }),
        }
    }

    fn next_tick(&self) -> u64 {
        self.inner.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get_state(&self) -> ResourceStoreState {
        self.inner.state.get_state()
    }

    /// Receiver notified after every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ResourceStoreState> {
        self.inner.state.subscribe()
    }

    pub fn get_context(&self) -> Value {
        self.inner.state.read(|state| state.context.clone())
    }

    pub fn set_context(&self, context: Value) {
        self.inner.state.modify(|state| state.context = context);
    }

    /// Read a slice without touching its access time.
    pub fn get_slice(&self, resource_type: &str, key: &str) -> Option<ResourceSlice> {
        self.inner
            .state
            .read(|state| state.slice(resource_type, key).cloned())
    }

    fn find_by_generation(&self, resource_type: &str, key: &str, generation: u64) -> Option<ResourceSlice> {
        self.inner.state.read(|state| {
            state
                .slice(resource_type, key)
                .filter(|s| s.generation == generation)
                .or_else(|| state.prefetched(resource_type, key).filter(|s| s.generation == generation))
                .cloned()
        })
    }

    fn current(&self, resource_type: &str, key: &str, slot: Slot) -> Option<ResourceSlice> {
        self.inner.state.read(|state| match slot {
            Slot::Data => state.slice(resource_type, key).cloned(),
            Slot::Prefetch => state
                .prefetched(resource_type, key)
                .or_else(|| state.slice(resource_type, key))
                .cloned(),
        })
    }

    /// Return the cached slice while usable, otherwise fetch it.
    pub async fn get_resource(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        options: GetResourceOptions,
    ) -> ResourceSlice {
        if options.is_static && resource.is_browser_only() {
            return ResourceSlice::default();
        }

        let resource_type = resource.resource_type();
        let key = resource.key(ctx, &self.get_context());
        let now = now_millis();
        let tick = self.next_tick();
        let max_age = resource.max_age();

        let cached = self.inner.state.modify_if(|state| {
            let slice = state.slice_mut(resource_type, &key)?;
            if slice.is_from_ssr() {
                slice.promise = Some(slice.settled_promise());
                slice.expires_at = Some(expires_at(now, max_age));
            } else if !slice.should_use_cache(now) {
                return None;
            }
            slice.accessed_at = Some(now);
            slice.access_tick = tick;
            Some(slice.clone())
        });

        if let Some(slice) = cached {
            metrics::record_resource_cache_hit(resource_type);
            return slice;
        }

        if options.prefetch {
            self.prefetch_resource_from_remote(resource, ctx, options).await
        } else {
            self.get_resource_from_remote(resource, ctx, options).await
        }
    }

    /// Fetch a resource, unless a fetch for the same key is already running.
    pub async fn get_resource_from_remote(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        options: GetResourceOptions,
    ) -> ResourceSlice {
        self.load(resource, ctx, options, Slot::Data, BTreeMap::new()).await
    }

    /// Fetch a resource into the prefetch slot.
    pub async fn prefetch_resource_from_remote(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        options: GetResourceOptions,
    ) -> ResourceSlice {
        self.load(resource, ctx, options, Slot::Prefetch, BTreeMap::new()).await
    }

    /// Request every resource concurrently and wait for them to settle.
    pub async fn request_resources(
        &self,
        resources: &[Arc<ResourceDefinition>],
        ctx: &RouterContext,
        options: GetResourceOptions,
    ) -> Vec<ResourceSlice> {
        let options = GetResourceOptions {
            prefetch: false,
            ..options
        };
        self.settle_all(resources, ctx, options, Slot::Data).await
    }

    pub async fn prefetch_resources(
        &self,
        resources: &[Arc<ResourceDefinition>],
        ctx: &RouterContext,
        options: GetResourceOptions,
    ) -> Vec<ResourceSlice> {
        let options = GetResourceOptions {
            prefetch: true,
            ..options
        };
        self.settle_all(resources, ctx, options, Slot::Prefetch).await
    }

    async fn settle_all(
        &self,
        resources: &[Arc<ResourceDefinition>],
        ctx: &RouterContext,
        options: GetResourceOptions,
        slot: Slot,
    ) -> Vec<ResourceSlice> {
        let custom = self.get_context();
        let requests = resources
            .iter()
            .filter(|resource| !(options.is_static && resource.is_browser_only()))
            .map(|resource| {
                let key = resource.key(ctx, &custom);
                async move {
                    let slice = match slot {
                        Slot::Data => self.get_resource(resource, ctx, options).await,
                        Slot::Prefetch => self.prefetch_resource_from_remote(resource, ctx, options).await,
                    };
                    self.settle(resource.resource_type(), &key, slice).await
                }
            });
        join_all(requests).await
    }

    /// Wait for a loading slice's promise and return the slice it committed.
    async fn settle(&self, resource_type: &str, key: &str, slice: ResourceSlice) -> ResourceSlice {
        if !slice.loading {
            return slice;
        }
        let Some(promise) = slice.promise.clone() else {
            return slice;
        };
        let _ = promise.await;
        self.find_by_generation(resource_type, key, slice.generation)
            .unwrap_or(slice)
    }

    /// `pinned` maps dependency types to generations the caller knows are
    /// current; those slices are reused even if already expired.
    async fn load(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        options: GetResourceOptions,
        slot: Slot,
        pinned: BTreeMap<String, u64>,
    ) -> ResourceSlice {
        let custom = self.get_context();
        let key = resource.key(ctx, &custom);
        let resource_type = resource.resource_type();
        let generation = self.next_tick();

        let work = self.fetch_work(
            Arc::clone(resource),
            ctx.clone(),
            key.clone(),
            custom,
            generation,
            options,
            slot,
            pinned,
        );
        let promise: ResourcePromise = work.boxed().shared();

        let pending = Pending {
            resource_type,
            key: &key,
            max_cache: resource.max_cache(),
            generation,
            now: now_millis(),
            prefetch_window: u64::try_from(self.inner.prefetch_max_age.as_millis()).unwrap_or(u64::MAX),
            promise: &promise,
        };
        let begin = self.inner.state.modify(|state| match slot {
            Slot::Data => begin_fetch(state, &pending),
            Slot::Prefetch => begin_prefetch(state, &pending),
        });

        if let Begin::Existing(slice) = begin {
            tracing::debug!(resource_type, key = %key, "Reusing in-flight or cached slice");
            return slice;
        }
        tracing::debug!(resource_type, key = %key, generation, ?slot, "Fetching resource");

        let settle = {
            let store = self.clone();
            let resource = Arc::clone(resource);
            let ctx = ctx.clone();
            let key = key.clone();
            async move {
                let _ = promise.await;
                store
                    .after_commit(&resource, &ctx, &key, generation, options, slot)
                    .await
            }
        };

        let Some(timeout) = options.timeout.or(self.inner.default_timeout) else {
            return settle.await;
        };

        // The fetch outlives the guard; a late result still commits if
        // nothing superseded it in the meantime.
        let mut handle = tokio::spawn(settle);
        match TimeoutGuard::new(timeout).race(&mut handle).await {
            Ok(Ok(slice)) => slice,
            Ok(Err(err)) => {
                tracing::error!(resource_type, key = %key, error = %err, "Resource fetch task failed");
                let failure = Err(ResourceError::fetch(err.to_string()));
                self.commit(resource, &key, generation, &failure, BTreeMap::new());
                self.current(resource_type, &key, slot).unwrap_or_default()
            }
            Err(_) => self.mark_timed_out(resource_type, &key, generation, timeout),
        }
    }

    /// The shared promise body: dependencies, data function, commit.
    #[allow(clippy::too_many_arguments)]
    fn fetch_work(
        &self,
        resource: Arc<ResourceDefinition>,
        ctx: RouterContext,
        key: String,
        custom: Value,
        generation: u64,
        options: GetResourceOptions,
        slot: Slot,
        pinned: BTreeMap<String, u64>,
    ) -> impl Future<Output = Result<Value, ResourceError>> + Send + 'static {
        let store = self.clone();
        async move {
            let (dependencies, dependency_generations) = store
                .resolve_dependencies(&resource, &ctx, options, slot, &pinned)
                .await;
            let fetch_ctx = ResourceFetchContext::new(&ctx, slot == Slot::Prefetch, dependencies);

            let result = resource.fetch(fetch_ctx, custom).await;
            store.commit(&resource, &key, generation, &result, dependency_generations);
            result
        }
    }

    async fn resolve_dependencies(
        &self,
        resource: &ResourceDefinition,
        ctx: &RouterContext,
        options: GetResourceOptions,
        slot: Slot,
        pinned: &BTreeMap<String, u64>,
    ) -> (HashMap<String, ResourceSlice>, BTreeMap<String, u64>) {
        let mut dependencies = HashMap::new();
        let mut generations = BTreeMap::new();
        if resource.depends().is_empty() {
            return (dependencies, generations);
        }

        let custom = self.get_context();
        for dependency_type in resource.depends() {
            let Some(dependency) = ctx.route.resources.get(dependency_type).cloned() else {
                tracing::warn!(
                    resource_type = resource.resource_type(),
                    dependency = %dependency_type,
                    "Dependency is not declared on the current route"
                );
                continue;
            };
            let key = dependency.key(ctx, &custom);

            let slice = match self.current(dependency_type, &key, slot) {
                Some(slice) if slice.loading && slice.promise.is_some() => slice,
                Some(slice) if !slice.loading && pinned.get(dependency_type) == Some(&slice.generation) => slice,
                _ => self.request_boxed(dependency, ctx.clone(), options, slot).await,
            };
            let slice = self.settle(dependency_type, &key, slice).await;

            generations.insert(dependency_type.clone(), slice.generation);
            dependencies.insert(dependency_type.clone(), slice);
        }
        (dependencies, generations)
    }

    fn request_boxed(
        &self,
        resource: Arc<ResourceDefinition>,
        ctx: RouterContext,
        options: GetResourceOptions,
        slot: Slot,
    ) -> BoxFuture<'static, ResourceSlice> {
        let store = self.clone();
        async move {
            match slot {
                Slot::Data => {
                    let options = GetResourceOptions {
                        prefetch: false,
                        ..options
                    };
                    store.get_resource(&resource, &ctx, options).await
                }
                Slot::Prefetch => store.prefetch_resource_from_remote(&resource, &ctx, options).await,
            }
        }
        .boxed()
    }

    /// Write a settled result if its generation is still current.
    fn commit(
        &self,
        resource: &ResourceDefinition,
        key: &str,
        generation: u64,
        result: &Result<Value, ResourceError>,
        dependency_generations: BTreeMap<String, u64>,
    ) -> bool {
        let resource_type = resource.resource_type();
        let now = now_millis();
        let expiry = expires_at(now, resource.max_age());

        let committed = self.inner.state.modify_if(|state| {
            let slice = match state
                .data
                .get_mut(resource_type)
                .and_then(|slices| slices.get_mut(key))
                .filter(|s| s.generation == generation)
            {
                Some(slice) => slice,
                None => state
                    .prefetching
                    .get_mut(resource_type)
                    .and_then(|slices| slices.get_mut(key))
                    .filter(|s| s.generation == generation)?,
            };

            match result {
                Ok(value) => {
                    slice.data = Some(value.clone());
                    slice.error = None;
                }
                Err(err) => slice.error = Some(err.clone()),
            }
            slice.loading = false;
            slice.expires_at = Some(expiry);
            slice.accessed_at = Some(now);
            slice.dependency_generations = dependency_generations;
            Some(())
        });

        match (committed.is_some(), result) {
            (true, Ok(_)) => metrics::record_resource_fetch(resource_type, "success"),
            (true, Err(err)) => {
                tracing::warn!(resource_type, key, error = %err, "Resource fetch failed");
                metrics::record_resource_fetch(resource_type, "error");
            }
            (false, _) => {
                tracing::debug!(resource_type, key, generation, "Discarding superseded resource result");
                metrics::record_resource_fetch(resource_type, "discarded");
            }
        }
        committed.is_some()
    }

    fn mark_timed_out(&self, resource_type: &str, key: &str, generation: u64, timeout: Duration) -> ResourceSlice {
        let error = ResourceError::timeout(timeout);
        tracing::warn!(
            resource_type,
            key,
            timeout_ms = timeout.as_millis() as u64,
            "Resource fetch timed out"
        );
        metrics::record_resource_fetch(resource_type, "timeout");

        let marked = self.inner.state.modify_if(|state| {
            let slice = match state
                .data
                .get_mut(resource_type)
                .and_then(|slices| slices.get_mut(key))
                .filter(|s| s.generation == generation)
            {
                Some(slice) => slice,
                None => state
                    .prefetching
                    .get_mut(resource_type)
                    .and_then(|slices| slices.get_mut(key))
                    .filter(|s| s.generation == generation)?,
            };
            // Settled just as the guard fired
            if !slice.loading {
                return Some(slice.clone());
            }
            slice.error = Some(error.clone());
            slice.promise = None;
            Some(slice.clone())
        });

        marked.unwrap_or_else(|| ResourceSlice {
            error: Some(error),
            loading: true,
            ..ResourceSlice::default()
        })
    }

    async fn after_commit(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        key: &str,
        generation: u64,
        options: GetResourceOptions,
        slot: Slot,
    ) -> ResourceSlice {
        let resource_type = resource.resource_type();
        match self.find_by_generation(resource_type, key, generation) {
            Some(slice) if !slice.loading => {
                if slot == Slot::Data {
                    if let Some(current) = self.superseded_dependencies(resource, ctx, &slice) {
                        tracing::debug!(resource_type, key, "Dependency changed during fetch, refetching");
                        return self
                            .fetch_boxed(Arc::clone(resource), ctx.clone(), options, current)
                            .await;
                    }
                    self.fan_out(resource, ctx, key, options).await;
                }
                slice
            }
            Some(slice) => slice,
            None => self.current(resource_type, key, slot).unwrap_or_default(),
        }
    }

    /// Current generations of the settled dependencies, if any of them moved
    /// past the generation `slice` was computed from.
    fn superseded_dependencies(
        &self,
        resource: &ResourceDefinition,
        ctx: &RouterContext,
        slice: &ResourceSlice,
    ) -> Option<BTreeMap<String, u64>> {
        if resource.depends().is_empty() || slice.error.is_some() {
            return None;
        }
        let custom = self.get_context();
        let mut current = BTreeMap::new();
        let mut superseded = false;

        for (dependency_type, &seen) in &slice.dependency_generations {
            let Some(dependency) = ctx.route.resources.get(dependency_type) else {
                continue;
            };
            let key = dependency.key(ctx, &custom);
            let Some(latest) = self.get_slice(dependency_type, &key) else {
                continue;
            };
            // A loading dependency refetches its dependents once it commits
            if latest.loading {
                continue;
            }
            superseded |= latest.generation != seen;
            current.insert(dependency_type.clone(), latest.generation);
        }
        superseded.then_some(current)
    }

    /// Refetch the current route's resources that depend on `resource`
    /// and were not computed from its current generation.
    async fn fan_out(
        &self,
        resource: &ResourceDefinition,
        ctx: &RouterContext,
        key: &str,
        options: GetResourceOptions,
    ) {
        let resource_type = resource.resource_type();
        let resources = &ctx.route.resources;
        if !resources.contains(resource_type) {
            return;
        }
        let dependents = resources.dependents_of(resource_type);
        if dependents.is_empty() {
            return;
        }
        let Some(generation) = self.get_slice(resource_type, key).map(|s| s.generation) else {
            return;
        };

        let custom = self.get_context();
        let options = GetResourceOptions {
            prefetch: false,
            ..options
        };
        let refetches: Vec<_> = dependents
            .into_iter()
            .filter(|dependent| {
                let dependent_key = dependent.key(ctx, &custom);
                let current = self.inner.state.read(|state| {
                    state
                        .slice(dependent.resource_type(), &dependent_key)
                        .is_some_and(|slice| {
                            slice.loading
                                || slice.dependency_generations.get(resource_type) == Some(&generation)
                        })
                });
                !current
            })
            .map(|dependent| {
                tracing::debug!(
                    resource_type,
                    dependent = dependent.resource_type(),
                    "Refetching dependent resource"
                );
                let pinned = BTreeMap::from([(resource_type.to_string(), generation)]);
                self.fetch_boxed(dependent, ctx.clone(), options, pinned)
            })
            .collect();

        join_all(refetches).await;
    }

    fn fetch_boxed(
        &self,
        resource: Arc<ResourceDefinition>,
        ctx: RouterContext,
        options: GetResourceOptions,
        pinned: BTreeMap<String, u64>,
    ) -> BoxFuture<'static, ResourceSlice> {
        let store = self.clone();
        async move { store.load(&resource, &ctx, options, Slot::Data, pinned).await }.boxed()
    }

    /// Apply `updater` to a slice's data. Dependents are refetched if the
    /// value changed.
    ///
    /// The updater runs outside the state lock and may read the store.
    pub async fn update_resource_state<F>(
        &self,
        resource: &Arc<ResourceDefinition>,
        ctx: &RouterContext,
        updater: F,
    ) -> ResourceSlice
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let resource_type = resource.resource_type();
        let key = resource.key(ctx, &self.get_context());
        let now = now_millis();
        let tick = self.next_tick();
        let max_age = resource.max_age();
        let max_cache = resource.max_cache();

        let previous = self.get_slice(resource_type, &key).and_then(|slice| slice.data);
        let next = updater(previous.clone());
        let changed = next != previous;

        let slice = self.inner.state.modify(|state| {
            let slices = state.data.entry(resource_type.to_string()).or_default();
            if !slices.contains_key(&key) {
                evict_least_recent(slices, resource_type, max_cache);
            }
            let slice = slices.entry(key.clone()).or_default();

            slice.data = next;
            slice.error = None;
            slice.loading = false;
            slice.expires_at = Some(expires_at(now, max_age));
            slice.accessed_at = Some(now);
            slice.access_tick = tick;
            // Supersedes any fetch still in flight
            slice.generation = tick;
            slice.promise = Some(slice.settled_promise());
            slice.clone()
        });

        if changed {
            tracing::debug!(resource_type, key = %key, "Resource state updated");
            self.fan_out(resource, ctx, &key, GetResourceOptions::default())
                .await;
        }
        slice
    }

    /// Remove the slice for the current key and its dependents, or every
    /// key of the type when no context is given.
    pub fn clear_resource(&self, resource: &ResourceDefinition, ctx: Option<&RouterContext>) {
        let resource_type = resource.resource_type();

        let Some(ctx) = ctx else {
            self.inner.state.modify(|state| {
                state.data.remove(resource_type);
                state.prefetching.remove(resource_type);
            });
            tracing::debug!(resource_type, "Cleared all keys of resource type");
            return;
        };

        let custom = self.get_context();
        let mut targets = vec![(resource_type.to_string(), resource.key(ctx, &custom))];
        if ctx.route.resources.contains(resource_type) {
            targets.extend(
                ctx.route
                    .resources
                    .transitive_dependents(resource_type)
                    .iter()
                    .map(|dependent| (dependent.resource_type().to_string(), dependent.key(ctx, &custom))),
            );
        }

        self.inner.state.modify(|state| {
            for (resource_type, key) in &targets {
                for map in [&mut state.data, &mut state.prefetching] {
                    if let Some(slices) = map.get_mut(resource_type) {
                        slices.remove(key);
                    }
                }
            }
        });
        tracing::debug!(resource_type, cleared = targets.len(), "Cleared resource slices");
    }

    /// Drop expired slices of `resources` for the given location.
    pub fn clean_expired_resources(&self, resources: &[Arc<ResourceDefinition>], ctx: &RouterContext) -> usize {
        let custom = self.get_context();
        let now = now_millis();
        let targets: Vec<(String, String)> = resources
            .iter()
            .map(|resource| (resource.resource_type().to_string(), resource.key(ctx, &custom)))
            .collect();

        let removed = self.inner.state.modify_if(|state| {
            let mut removed = 0;
            for (resource_type, key) in &targets {
                let Some(slices) = state.data.get_mut(resource_type) else {
                    continue;
                };
                let expired = slices
                    .get(key)
                    .is_some_and(|slice| slice.is_expired(now) && !(slice.loading && slice.promise.is_some()));
                if expired {
                    slices.remove(key);
                    removed += 1;
                }
            }
            (removed > 0).then_some(removed)
        });

        let removed = removed.unwrap_or(0);
        if removed > 0 {
            tracing::debug!(removed, "Removed expired resource slices");
        }
        removed
    }

    /// Seed the store with serialized state. Keys already present win.
    pub fn hydrate(&self, hydration: HydrationState) {
        let HydrationState {
            resource_data,
            resource_context,
        } = hydration;

        let added = self.inner.state.modify(|state| {
            if state.context.is_null() {
                if let Some(context) = resource_context {
                    state.context = context;
                }
            }
            serialize::merge(&mut state.data, resource_data)
        });
        tracing::info!("Hydrated {} resource slices", added);
    }

    /// JSON-safe snapshot of every cached slice.
    pub fn get_safe_data(&self) -> SerializedData {
        self.inner.state.read(|state| serialize::snapshot(&state.data))
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStore")
            .field("default_timeout", &self.inner.default_timeout)
            .field("prefetch_max_age", &self.inner.prefetch_max_age)
            .finish_non_exhaustive()
    }
}

fn begin_fetch(state: &mut ResourceStoreState, pending: &Pending<'_>) -> Begin {
    let Pending {
        resource_type,
        key,
        max_cache,
        generation,
        now,
        prefetch_window,
        promise,
    } = *pending;

    if let Some(slice) = state.slice(resource_type, key) {
        if slice.loading && slice.promise.is_some() {
            return Begin::Existing(slice.clone());
        }
    }

    // A prefetched slice is promoted once, if still within its window
    let prefetched = state
        .prefetching
        .get_mut(resource_type)
        .and_then(|slices| slices.remove(key))
        .filter(|slice| {
            !slice.is_timed_out()
                && slice
                    .prefetched_at
                    .is_some_and(|at| now < at.saturating_add(prefetch_window))
        });

    let slices = state.data.entry(resource_type.to_string()).or_default();
    if !slices.contains_key(key) {
        evict_least_recent(slices, resource_type, max_cache);
    }

    if let Some(mut slice) = prefetched {
        slice.prefetched_at = None;
        slice.accessed_at = Some(now);
        slice.access_tick = generation;
        slices.insert(key.to_string(), slice.clone());
        tracing::debug!(resource_type, key, "Promoted prefetched slice");
        return Begin::Existing(slice);
    }

    let previous = slices.remove(key).unwrap_or_default();
    slices.insert(
        key.to_string(),
        ResourceSlice {
            data: previous.data,
            error: None,
            loading: true,
            promise: Some(promise.clone()),
            expires_at: previous.expires_at,
            accessed_at: Some(now),
            generation,
            access_tick: generation,
            prefetched_at: None,
            dependency_generations: previous.dependency_generations,
        },
    );
    Begin::Started
}

fn begin_prefetch(state: &mut ResourceStoreState, pending: &Pending<'_>) -> Begin {
    let Pending {
        resource_type,
        key,
        generation,
        now,
        prefetch_window,
        promise,
        ..
    } = *pending;

    if let Some(slice) = state.slice(resource_type, key) {
        if slice.is_from_ssr() || slice.should_use_cache(now) {
            return Begin::Existing(slice.clone());
        }
    }

    let slices = state.prefetching.entry(resource_type.to_string()).or_default();
    if let Some(existing) = slices.get(key) {
        let fresh = existing
            .prefetched_at
            .is_some_and(|at| now < at.saturating_add(prefetch_window));
        if fresh && !existing.is_timed_out() {
            return Begin::Existing(existing.clone());
        }
    }

    slices.insert(
        key.to_string(),
        ResourceSlice {
            loading: true,
            promise: Some(promise.clone()),
            accessed_at: Some(now),
            generation,
            access_tick: generation,
            prefetched_at: Some(now),
            ..ResourceSlice::default()
        },
    );
    Begin::Started
}

/// Make room for one more key.
fn evict_least_recent(slices: &mut HashMap<String, ResourceSlice>, resource_type: &str, max_cache: usize) {
    while !slices.is_empty() && slices.len() >= max_cache {
        let Some(oldest) = slices
            .iter()
            .min_by_key(|(_, slice)| slice.access_tick)
            .map(|(key, _)| key.clone())
        else {
            break;
        };
        slices.remove(&oldest);
        tracing::debug!(resource_type, key = %oldest, "Evicted least recently accessed slice");
        metrics::record_resource_eviction(resource_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::definition::ResourceSet;
    use crate::routing::{Resolver, Route};
    use std::sync::atomic::AtomicUsize;

    fn counting(resource_type: &str, calls: Arc<AtomicUsize>) -> ResourceDefinition {
        ResourceDefinition::new(
            resource_type,
            |ctx: &RouterContext, _: &Value| ctx.param("id").unwrap_or("none").to_string(),
            move |ctx: ResourceFetchContext, _| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, ResourceError>(serde_json::json!({ "id": ctx.param("id"), "call": n }))
                }
            },
        )
    }

    fn context(resources: ResourceSet, url: &str) -> RouterContext {
        let resolver = Resolver::default();
        let table = resolver
            .table(vec![Route::new("/items/:id").with_resources(resources)])
            .unwrap();
        resolver.resolve_url(&table, url, "").unwrap()
    }

    #[tokio::test]
    async fn test_fresh_slice_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(counting("item", Arc::clone(&calls)).with_max_age(Duration::from_secs(60)));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/1");
        let store = ResourceStore::new();

        let first = store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;
        let second = store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.data, second.data);
        assert!(!second.loading);
        assert!(second.accessed_at.is_some());
    }

    #[tokio::test]
    async fn test_superseded_result_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(ResourceDefinition::new(
            "slow",
            |_: &RouterContext, _: &Value| "k".to_string(),
            {
                let calls = Arc::clone(&calls);
                move |_, _| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, ResourceError>(Value::from("fetched"))
                    }
                }
            },
        ));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/1");
        let store = ResourceStore::new();

        let fetch = {
            let store = store.clone();
            let resource = Arc::clone(&resource);
            let ctx = ctx.clone();
            tokio::spawn(async move { store.get_resource_from_remote(&resource, &ctx, GetResourceOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.clear_resource(&resource, Some(&ctx));
        fetch.await.unwrap();

        // Cleared mid-flight: the late result does not resurrect the key
        assert!(store.get_slice("slow", "k").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_supersedes_in_flight_fetch() {
        let resource = Arc::new(ResourceDefinition::new(
            "slow",
            |_: &RouterContext, _: &Value| "k".to_string(),
            |_, _| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, ResourceError>(Value::from("fetched"))
            },
        ));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/1");
        let store = ResourceStore::new();

        let fetch = {
            let (store, resource, ctx) = (store.clone(), Arc::clone(&resource), ctx.clone());
            tokio::spawn(async move { store.get_resource_from_remote(&resource, &ctx, GetResourceOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .update_resource_state(&resource, &ctx, |_| Some(Value::from("local")))
            .await;
        fetch.await.unwrap();

        let slice = store.get_slice("slow", "k").unwrap();
        assert_eq!(slice.data, Some(Value::from("local")));
        assert!(!slice.loading);
    }

    #[tokio::test]
    async fn test_error_retains_previous_data() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let resource = Arc::new(ResourceDefinition::new(
            "flaky",
            |_: &RouterContext, _: &Value| "k".to_string(),
            {
                let fail = Arc::clone(&fail);
                move |_, _| {
                    let fail = fail.load(Ordering::SeqCst);
                    async move {
                        if fail {
                            Err(ResourceError::fetch("backend down"))
                        } else {
                            Ok(Value::from(1))
                        }
                    }
                }
            },
        ));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/1");
        let store = ResourceStore::new();

        store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;
        fail.store(true, Ordering::SeqCst);
        let slice = store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;

        assert_eq!(slice.data, Some(Value::from(1)));
        assert_eq!(slice.error, Some(ResourceError::fetch("backend down")));
        assert!(!slice.loading);
    }

    #[tokio::test]
    async fn test_browser_only_skipped_when_static() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(counting("client", Arc::clone(&calls)).browser_only(true));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/1");
        let store = ResourceStore::new();

        let options = GetResourceOptions {
            is_static: true,
            ..GetResourceOptions::default()
        };
        let slices = store.request_resources(&[Arc::clone(&resource)], &ctx, options).await;
        assert!(slices.is_empty());
        assert!(store.get_resource(&resource, &ctx, options).await.data.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prefetch_promoted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(counting("item", Arc::clone(&calls)));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/4");
        let store = ResourceStore::new();

        let prefetched = store
            .prefetch_resource_from_remote(&resource, &ctx, GetResourceOptions::default())
            .await;
        assert!(prefetched.data.is_some());
        assert!(store.get_slice("item", "4").is_none());

        // First request promotes the prefetched data without a new fetch
        let slice = store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;
        assert_eq!(slice.data, prefetched.data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Max age zero: the next request fetches again
        store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clean_expired() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resource = Arc::new(counting("item", Arc::clone(&calls)));
        let ctx = context(ResourceSet::new([Arc::clone(&resource)]).unwrap(), "/items/2");
        let store = ResourceStore::new();

        store.get_resource(&resource, &ctx, GetResourceOptions::default()).await;
        assert!(store.get_slice("item", "2").is_some());
        assert_eq!(store.clean_expired_resources(&[Arc::clone(&resource)], &ctx), 1);
        assert!(store.get_slice("item", "2").is_none());
    }

    #[test]
    fn test_context_round_trip() {
        let store = ResourceStore::new();
        assert!(store.get_context().is_null());
        store.set_context(serde_json::json!({ "locale": "en" }));
        assert_eq!(store.get_context()["locale"], "en");
    }

    #[test]
    fn test_eviction_picks_least_recent() {
        let mut slices = HashMap::new();
        for (key, tick) in [("a", 3), ("b", 1), ("c", 2)] {
            slices.insert(
                key.to_string(),
                ResourceSlice {
                    access_tick: tick,
                    ..ResourceSlice::default()
                },
            );
        }
        evict_least_recent(&mut slices, "t", 3);
        assert!(!slices.contains_key("b"));
        assert_eq!(slices.len(), 2);
    }
}
