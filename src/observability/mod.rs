//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! routing + resources produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters via the `metrics` facade)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Library code only emits; the binary installs subscriber and recorder
//! - Without an installed recorder every metric call is a no-op

pub mod logging;
pub mod metrics;
