//! Router lifecycle adapter for the resource store.
//!
//! A router calls these hooks around navigation:
//! - `before_route_load`: drop expired slices the next location will need
//! - `route_load`: start loading the location's resources
//! - `route_prefetch`: warm the prefetch slot for a likely next location
//! - `get_serialized_resources`: wait for the last load, then snapshot

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;

use crate::resources::definition::ResourceDefinition;
use crate::resources::serialize::SerializedData;
use crate::resources::slice::ResourceSlice;
use crate::resources::store::{GetResourceOptions, ResourceStore};
use crate::routing::RouterContext;

/// Completion of one `route_load` batch.
pub type LoadBatch = Shared<BoxFuture<'static, ()>>;

/// Resources of `next` that are not already loaded for `prev`: new types,
/// or types whose key changed between the two locations.
pub fn resources_for_next_location(
    store: &ResourceStore,
    prev: Option<&RouterContext>,
    next: &RouterContext,
) -> Vec<Arc<ResourceDefinition>> {
    let Some(prev) = prev else {
        return next.route.resources.as_slice().to_vec();
    };

    let custom = store.get_context();
    next.route
        .resources
        .iter()
        .filter(|resource| match prev.route.resources.get(resource.resource_type()) {
            Some(previous) => previous.key(prev, &custom) != resource.key(next, &custom),
            None => true,
        })
        .cloned()
        .collect()
}

/// Lifecycle hooks wired to one store.
#[derive(Clone)]
pub struct ResourcesPlugin {
    store: ResourceStore,
    options: GetResourceOptions,
    latest: Arc<Mutex<Option<LoadBatch>>>,
}

impl ResourcesPlugin {
    pub fn new(store: ResourceStore, options: GetResourceOptions) -> Self {
        Self {
            store,
            options,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Clear expired slices the next location is about to request.
    pub fn before_route_load(&self, context: Option<&RouterContext>, next: &RouterContext) {
        let resources = resources_for_next_location(&self.store, context, next);
        self.store.clean_expired_resources(&resources, next);
    }

    /// Start loading the resources for `context` on the runtime.
    ///
    /// Only resources that changed since `prev` are requested. Must be called
    /// from within a Tokio runtime.
    pub fn route_load(&self, context: &RouterContext, prev: Option<&RouterContext>) -> LoadBatch {
        let resources = resources_for_next_location(&self.store, prev, context);
        tracing::debug!(
            route = %context.route.label(),
            resources = resources.len(),
            "Loading route resources"
        );

        let handle = self.spawn_batch(resources, context.clone(), self.options);
        let batch = async move {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Route resource batch failed");
            }
        }
        .boxed()
        .shared();

        *self.latest.lock().expect("plugin batch mutex poisoned") = Some(batch.clone());
        batch
    }

    /// Prefetch the resources `next` would need after `context`.
    pub fn route_prefetch(&self, context: &RouterContext, next: &RouterContext) -> JoinHandle<Vec<ResourceSlice>> {
        let resources = resources_for_next_location(&self.store, Some(context), next);
        let options = GetResourceOptions {
            prefetch: true,
            ..self.options
        };
        let store = self.store.clone();
        let next = next.clone();
        tokio::spawn(async move { store.prefetch_resources(&resources, &next, options).await })
    }

    /// Snapshot the store once the latest load has settled.
    pub async fn get_serialized_resources(&self) -> SerializedData {
        let latest = self.latest.lock().expect("plugin batch mutex poisoned").clone();
        if let Some(batch) = latest {
            batch.await;
        }
        self.store.get_safe_data()
    }

    fn spawn_batch(
        &self,
        resources: Vec<Arc<ResourceDefinition>>,
        context: RouterContext,
        options: GetResourceOptions,
    ) -> JoinHandle<Vec<ResourceSlice>> {
        let store = self.store.clone();
        tokio::spawn(async move { store.request_resources(&resources, &context, options).await })
    }
}

impl fmt::Debug for ResourcesPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcesPlugin")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
