//! Adaptive scheduling
//!
//! In-run rebalancing (controller) and history-driven pre-run tuning
//! (optimizer).

pub mod controller;
pub mod optimizer;

pub use controller::{
    AdaptationRule, AdaptiveController, LOAD_PRESSURE_RATIO, PRIORITY_BOOST_CEILING,
};
pub use optimizer::{
    ExecutionRecord, PerformanceOptimizer, CRITICAL_PATH_BOOST, HISTORY_WINDOW,
};
