//! Client-side route resolution and route resource caching.
//!
//! Two subsystems do the work:
//! - [`routing`] resolves a URL against a declared route list into a single
//!   best [`Match`](routing::Match).
//! - [`resources`] fetches, caches, expires and serializes the data each
//!   matched route declares.
//!
//! Everything else is the ambient stack around them: configuration, logging
//! and metrics, timeouts, and lifecycle helpers for the CLI.

pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod resources;
pub mod routing;

pub use config::schema::RouterConfig;
pub use resources::{ResourceDefinition, ResourceSet, ResourceStore, ResourcesPlugin};
pub use routing::{Match, Resolver, Route, RouteTable, RouterContext};
