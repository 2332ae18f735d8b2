//! Lifecycle management for the CLI.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → latched flag → every ShutdownSignal::wait() resolves → loops exit
//! ```
//!
//! # Design Decisions
//! - One coordinator per process, cloned into each long-running task
//! - Library types hold no background tasks, so only the binary needs this

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
