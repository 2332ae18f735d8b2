//! Resource cache and loader.
//!
//! # Data Flow
//! ```text
//! Per navigation (plugin.rs):
//!     RouterContext
//!     → definition.rs (route's ResourceSet, key per resource)
//!     → store.rs
//!         cache hit        → slice
//!         miss / stale     → dependencies → data function → commit
//!         after commit     → refetch dependents on the current route
//!     → state.rs (type → key → slice, subscribers notified)
//!
//! Server render hand-off:
//!     store.get_safe_data() → serialize.rs → JSON
//!     JSON → serialize.rs → store.hydrate()
//! ```
//!
//! # Design Decisions
//! - The store is an explicit, cloneable service; no global registry
//! - Resource data is `serde_json::Value`; typed access via `data_as`
//! - At most one fetch per key; stale results are discarded by generation
//! - Timeouts leave the fetch running (see `store.rs`)

pub mod definition;
pub mod plugin;
pub mod serialize;
pub mod slice;
pub mod state;
pub mod store;

pub use definition::{
    ResourceConfigError, ResourceDefinition, ResourceFetchContext, ResourceSet, DEFAULT_MAX_CACHE,
    MAX_AGE_INFINITE,
};
pub use plugin::{resources_for_next_location, LoadBatch, ResourcesPlugin};
pub use serialize::{HydrationState, SerializedData, SerializedError, SerializedSlice};
pub use slice::{ResourceError, ResourcePromise, ResourceSlice};
pub use state::{ResourceStoreState, StateContainer};
pub use store::{GetResourceOptions, ResourceStore, DEFAULT_PREFETCH_MAX_AGE};
