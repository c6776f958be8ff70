//! Worker management
//!
//! Capability-tagged workers, load tracking, and least-loaded selection.

pub mod registry;

pub use registry::{pick_worker, WorkerInfo, WorkerLease, WorkerRegistry, BOTTLENECK_LOAD};
