//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Resource fetch with a timeout:
//!     → timeouts.rs (race the fetch against a deadline)
//!     → On elapse: slice marked timed out, fetch keeps running
//! ```
//!
//! # Design Decisions
//! - A deadline never cancels the work it guards
//! - Guards are cancellable so callers can stop waiting early

pub mod timeouts;

pub use timeouts::{Elapsed, TimeoutGuard};
