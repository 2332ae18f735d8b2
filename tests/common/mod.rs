//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use resource_router::resources::{ResourceDefinition, ResourceError, ResourceFetchContext, ResourceSet};
use resource_router::routing::{Resolver, Route, RouteTable, RouterContext};

/// Counts data function invocations of a test resource.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A resource keyed by the `:id` parameter whose data records the call
/// number. Each fetch sleeps `delay` first.
pub fn counted(resource_type: &str, calls: &Calls, delay: Duration) -> ResourceDefinition {
    let calls = calls.clone();
    let name = resource_type.to_string();
    ResourceDefinition::new(
        resource_type,
        |ctx: &RouterContext, _: &Value| ctx.param("id").unwrap_or_default().to_string(),
        move |ctx: ResourceFetchContext, _: Value| {
            let call = calls.bump();
            let name = name.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, ResourceError>(json!({
                    "type": name,
                    "id": ctx.param("id").unwrap_or_default(),
                    "call": call,
                }))
            }
        },
    )
}

/// Resolve `url` against a single `/items/:id` route carrying `resources`.
pub fn item_context(resources: Vec<Arc<ResourceDefinition>>, url: &str) -> RouterContext {
    let set = ResourceSet::new(resources).expect("valid resource set");
    let resolver = Resolver::default();
    let table = resolver
        .table(vec![Route::new("/items/:id").exact(true).with_resources(set)])
        .expect("valid route table");
    resolver
        .resolve_url(&table, url, "")
        .expect("item route matches")
}

/// Build a table from bare patterns, in order.
pub fn table(resolver: &Resolver, patterns: &[&str]) -> RouteTable {
    let routes = patterns.iter().map(|p| Route::new(*p)).collect();
    resolver.table(routes).expect("valid route table")
}

/// The pattern of the route `url` resolves to, if any.
pub fn resolved_path(resolver: &Resolver, table: &RouteTable, url: &str) -> Option<String> {
    resolver
        .resolve_url(table, url, "")
        .map(|ctx| ctx.route.path.clone())
}
