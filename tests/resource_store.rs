//! Resource store behaviour through the public API.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{counted, item_context, Calls};
use resource_router::resources::{
    GetResourceOptions, HydrationState, ResourceDefinition, ResourceError, ResourceFetchContext, ResourceStore,
    MAX_AGE_INFINITE,
};
use resource_router::routing::RouterContext;

fn by_id(ctx: &RouterContext, _: &Value) -> String {
    ctx.param("id").unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_dependent_refetched_once_with_dependency_data() {
    let store = ResourceStore::new();
    let a_calls = Calls::default();
    let a = Arc::new(counted("a", &a_calls, Duration::from_millis(10)));

    let b_calls = Arc::new(AtomicUsize::new(0));
    let b = {
        let b_calls = Arc::clone(&b_calls);
        Arc::new(
            ResourceDefinition::from_fn("b", by_id, move |ctx: &ResourceFetchContext, _: &Value| {
                b_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "seen": ctx.dependency_data("a").cloned() }))
            })
            .depends_on(["a"]),
        )
    };

    let ctx = item_context(vec![Arc::clone(&a), Arc::clone(&b)], "/items/1");
    let slice = store
        .get_resource_from_remote(&a, &ctx, GetResourceOptions::default())
        .await;

    assert!(!slice.loading);
    assert_eq!(a_calls.get(), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    let a_data = store.get_slice("a", "1").unwrap().data.unwrap();
    let b_data = store.get_slice("b", "1").unwrap().data.unwrap();
    assert_eq!(b_data["seen"], a_data);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::from_millis(50)));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/7");

    let options = GetResourceOptions::default();
    let (first, second) = tokio::join!(
        store.get_resource_from_remote(&resource, &ctx, options),
        store.get_resource_from_remote(&resource, &ctx, options),
    );

    assert_eq!(calls.get(), 1);
    // Whichever call started second got the in-flight slice
    assert!(!first.loading || !second.loading);

    let settled = store.get_slice("item", "7").unwrap();
    assert!(!settled.loading);
    assert_eq!(settled.data.unwrap()["call"], 1);
}

#[tokio::test]
async fn test_zero_max_age_always_refetches() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/1");

    for expected in 1..=2 {
        let slice = store
            .get_resource(&resource, &ctx, GetResourceOptions::default())
            .await;
        assert_eq!(slice.data.unwrap()["call"], expected);
    }
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_infinite_max_age_fetches_once() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::ZERO).with_max_age(MAX_AGE_INFINITE));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/1");

    for _ in 0..3 {
        let slice = store
            .get_resource(&resource, &ctx, GetResourceOptions::default())
            .await;
        assert_eq!(slice.data.unwrap()["call"], 1);
    }
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_max_cache_evicts_least_recently_accessed() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(
        counted("item", &calls, Duration::ZERO)
            .with_max_age(MAX_AGE_INFINITE)
            .with_max_cache(2),
    );

    for id in ["a", "b", "c"] {
        let ctx = item_context(vec![Arc::clone(&resource)], &format!("/items/{id}"));
        store
            .get_resource(&resource, &ctx, GetResourceOptions::default())
            .await;
    }

    let state = store.get_state();
    let keys: Vec<&String> = {
        let mut keys: Vec<_> = state.data["item"].keys().collect();
        keys.sort();
        keys
    };
    assert_eq!(keys, vec!["b", "c"]);
}

#[tokio::test]
async fn test_touching_a_key_protects_it_from_eviction() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(
        counted("item", &calls, Duration::ZERO)
            .with_max_age(MAX_AGE_INFINITE)
            .with_max_cache(2),
    );
    let ctx = |id: &str| item_context(vec![Arc::clone(&resource)], &format!("/items/{id}"));
    let options = GetResourceOptions::default();

    store.get_resource(&resource, &ctx("a"), options).await;
    store.get_resource(&resource, &ctx("b"), options).await;
    // Cache hit refreshes a's access
    store.get_resource(&resource, &ctx("a"), options).await;
    store.get_resource(&resource, &ctx("c"), options).await;

    assert!(store.get_slice("item", "a").is_some());
    assert!(store.get_slice("item", "b").is_none());
    assert_eq!(calls.get(), 3);
}

#[tokio::test]
async fn test_hydrate_reproduces_safe_data() {
    let store = ResourceStore::new();
    store.set_context(json!({ "locale": "en" }));

    let calls = Calls::default();
    let good = Arc::new(counted("good", &calls, Duration::ZERO));
    let bad = Arc::new(ResourceDefinition::from_fn(
        "bad",
        by_id,
        |_: &ResourceFetchContext, _: &Value| Err(ResourceError::fetch("backend unavailable")),
    ));
    let ctx = item_context(vec![Arc::clone(&good), Arc::clone(&bad)], "/items/3");
    store
        .request_resources(&[good, bad], &ctx, GetResourceOptions::default())
        .await;

    // Through the wire format, as a server render would ship it
    let wire = serde_json::to_string(&HydrationState {
        resource_data: store.get_safe_data(),
        resource_context: Some(store.get_context()),
    })
    .unwrap();
    let hydration: HydrationState = serde_json::from_str(&wire).unwrap();

    let fresh = ResourceStore::new();
    fresh.hydrate(hydration);

    assert_eq!(fresh.get_context(), json!({ "locale": "en" }));
    for (resource_type, key) in [("good", "3"), ("bad", "3")] {
        let before = store.get_slice(resource_type, key).unwrap();
        let after = fresh.get_slice(resource_type, key).unwrap();
        assert_eq!(after.data, before.data, "{resource_type}");
        assert_eq!(after.loading, before.loading, "{resource_type}");
        assert_eq!(after.error, before.error, "{resource_type}");
    }
    assert_eq!(fresh.get_safe_data(), store.get_safe_data());
}

#[tokio::test]
async fn test_hydrated_slice_served_without_fetching() {
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/9");

    let server = ResourceStore::new();
    server
        .request_resources(&[Arc::clone(&resource)], &ctx, GetResourceOptions::default())
        .await;

    let client = ResourceStore::new();
    client.hydrate(HydrationState {
        resource_data: server.get_safe_data(),
        resource_context: None,
    });

    let slice = client
        .get_resource(&resource, &ctx, GetResourceOptions::default())
        .await;
    assert_eq!(slice.data.unwrap()["call"], 1);
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_timeout_then_late_result_commits() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("slow", &calls, Duration::from_millis(100)));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/1");

    let options = GetResourceOptions {
        timeout: Some(Duration::from_millis(20)),
        ..GetResourceOptions::default()
    };
    let slice = store.get_resource(&resource, &ctx, options).await;
    assert!(slice.is_timed_out());
    assert!(slice.loading);
    assert_eq!(slice.error.as_ref().map(ResourceError::name), Some("TimeoutError"));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let slice = store.get_slice("slow", "1").unwrap();
    assert!(!slice.loading);
    assert!(slice.error.is_none());
    assert_eq!(slice.data.unwrap()["call"], 1);
}

#[tokio::test]
async fn test_late_result_discarded_after_update() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("slow", &calls, Duration::from_millis(100)));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/1");

    let options = GetResourceOptions {
        timeout: Some(Duration::from_millis(20)),
        ..GetResourceOptions::default()
    };
    store.get_resource(&resource, &ctx, options).await;
    store
        .update_resource_state(&resource, &ctx, |_| Some(json!("local")))
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let slice = store.get_slice("slow", "1").unwrap();
    assert_eq!(slice.data, Some(json!("local")));
    assert!(slice.error.is_none());
}

#[tokio::test]
async fn test_subscribers_see_commits() {
    let store = ResourceStore::new();
    let mut updates = store.subscribe();
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/4");

    store
        .request_resources(&[resource], &ctx, GetResourceOptions::default())
        .await;

    assert!(updates.has_changed().unwrap());
    let state = updates.borrow_and_update().clone();
    assert!(state.data["item"]["4"].data.is_some());
}

/// A resource of `resource_type` depending on "a" that records the data of
/// "a" it was computed from. Each fetch sleeps `delay` first.
fn echoing_a(resource_type: &str, calls: &Arc<AtomicUsize>, delay: Duration) -> ResourceDefinition {
    let calls = Arc::clone(calls);
    ResourceDefinition::new(resource_type, by_id, move |ctx: ResourceFetchContext, _: Value| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let seen = ctx.dependency_data("a").cloned();
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, ResourceError>(json!({ "seen": seen, "call": call }))
        }
    })
    .depends_on(["a"])
}

#[tokio::test]
async fn test_expired_dependency_refetched_for_dependent() {
    let store = ResourceStore::new();
    let a_calls = Calls::default();
    let a = Arc::new(counted("a", &a_calls, Duration::ZERO));
    let b_calls = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(echoing_a("b", &b_calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&a), Arc::clone(&b)], "/items/1");
    let options = GetResourceOptions::default();

    store.get_resource_from_remote(&a, &ctx, options).await;
    assert_eq!(a_calls.get(), 1);

    // a has max age zero, so b's own fetch must not reuse it
    store.get_resource_from_remote(&b, &ctx, options).await;
    assert_eq!(a_calls.get(), 2);

    let a_data = store.get_slice("a", "1").unwrap().data.unwrap();
    let b_data = store.get_slice("b", "1").unwrap().data.unwrap();
    assert_eq!(a_data["call"], 2);
    assert_eq!(b_data["seen"], a_data);
}

#[tokio::test]
async fn test_dependent_in_flight_during_dependency_refetch_catches_up() {
    let store = ResourceStore::new();
    let a_calls = Calls::default();
    let a = Arc::new(counted("a", &a_calls, Duration::from_millis(10)).with_max_age(MAX_AGE_INFINITE));
    let b_calls = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(echoing_a("b", &b_calls, Duration::from_millis(50)));
    let ctx = item_context(vec![Arc::clone(&a), Arc::clone(&b)], "/items/1");
    let options = GetResourceOptions::default();

    store.get_resource_from_remote(&a, &ctx, options).await;
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    // b reads a's first value, then a changes while b is still fetching
    tokio::join!(store.get_resource_from_remote(&b, &ctx, options), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.get_resource_from_remote(&a, &ctx, options).await
    });

    let a_slice = store.get_slice("a", "1").unwrap();
    let b_slice = store.get_slice("b", "1").unwrap();
    assert_eq!(a_calls.get(), 2);
    assert_eq!(b_calls.load(Ordering::SeqCst), 3);
    assert_eq!(b_slice.data.unwrap()["seen"], a_slice.data.unwrap());
}

#[tokio::test]
async fn test_updater_can_read_the_store() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let resource = Arc::new(counted("item", &calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&resource)], "/items/1");
    store
        .get_resource(&resource, &ctx, GetResourceOptions::default())
        .await;

    let reader = store.clone();
    let slice = store
        .update_resource_state(&resource, &ctx, move |previous| {
            let observed = reader.get_slice("item", "1").and_then(|slice| slice.data);
            assert_eq!(observed, previous);
            previous.map(|data| json!({ "wrapped": data }))
        })
        .await;

    assert_eq!(slice.data.unwrap()["wrapped"]["call"], 1);
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_update_refetches_dependents_only_on_change() {
    let store = ResourceStore::new();
    let a_calls = Calls::default();
    let a = Arc::new(counted("a", &a_calls, Duration::ZERO));
    let b_calls = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(echoing_a("b", &b_calls, Duration::ZERO));
    let ctx = item_context(vec![Arc::clone(&a), Arc::clone(&b)], "/items/1");

    store
        .get_resource_from_remote(&a, &ctx, GetResourceOptions::default())
        .await;
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    store.update_resource_state(&a, &ctx, |previous| previous).await;
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    store
        .update_resource_state(&a, &ctx, |_| Some(json!("changed")))
        .await;
    assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    assert_eq!(a_calls.get(), 1);

    let b_data = store.get_slice("b", "1").unwrap().data.unwrap();
    assert_eq!(b_data["seen"], json!("changed"));
}

#[tokio::test]
async fn test_clear_removes_transitive_dependents() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let a = Arc::new(counted("a", &calls, Duration::ZERO));
    let b = Arc::new(
        ResourceDefinition::from_fn("b", by_id, |_: &ResourceFetchContext, _: &Value| Ok(json!("b"))).depends_on(["a"]),
    );
    let c = Arc::new(
        ResourceDefinition::from_fn("c", by_id, |_: &ResourceFetchContext, _: &Value| Ok(json!("c"))).depends_on(["b"]),
    );
    let unrelated = Arc::new(counted("d", &calls, Duration::ZERO));
    let resources = vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&c), Arc::clone(&unrelated)];
    let ctx = item_context(resources.clone(), "/items/1");

    store
        .request_resources(&resources, &ctx, GetResourceOptions::default())
        .await;
    for resource_type in ["a", "b", "c", "d"] {
        assert!(store.get_slice(resource_type, "1").is_some(), "{resource_type}");
    }

    store.clear_resource(&a, Some(&ctx));

    for resource_type in ["a", "b", "c"] {
        assert!(store.get_slice(resource_type, "1").is_none(), "{resource_type}");
    }
    assert!(store.get_slice("d", "1").is_some());
}

#[tokio::test]
async fn test_clear_without_context_removes_every_key_of_type() {
    let store = ResourceStore::new();
    let calls = Calls::default();
    let item = Arc::new(counted("item", &calls, Duration::ZERO));
    let other = Arc::new(counted("other", &calls, Duration::ZERO));
    let options = GetResourceOptions::default();

    for id in ["1", "2"] {
        let ctx = item_context(vec![Arc::clone(&item), Arc::clone(&other)], &format!("/items/{id}"));
        store.get_resource(&item, &ctx, options).await;
        store.get_resource(&other, &ctx, options).await;
    }

    store.clear_resource(&item, None);

    let state = store.get_state();
    assert!(state.data.get("item").map_or(true, |slices| slices.is_empty()));
    assert_eq!(state.data["other"].len(), 2);
}
