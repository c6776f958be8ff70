//! TaskDeck - Dependency-Aware Workflow Execution Engine
//!
//! Coordinates capability-tagged workers through dependency-aware
//! scheduling: workflows are validated DAGs of steps, executed under one
//! of four strategies with retry, critical-path analysis, and adaptive
//! in-run rebalancing.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Data model, validation, DAG analysis, and YAML parsing
//! - [`worker`]: Worker registry with least-loaded capability selection
//! - [`execution`]: The engine, step dispatch, retries, and the event stream
//! - [`adaptive`]: In-run rebalancing and history-driven pre-run tuning
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use taskdeck::execution::{EngineConfig, ExecutionEngine, SimulationExecutor};
//! use taskdeck::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("pipeline.yaml")?;
//!
//!     // Create the engine and register workers
//!     let engine = ExecutionEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(SimulationExecutor::new(0)),
//!     );
//!     engine.register_worker("worker-1", ["compute"], 4);
//!
//!     // Execute the workflow and await its verdict
//!     let id = engine.submit(workflow).await?;
//!     let run = engine.execute_workflow(id, HashMap::new(), None).await?;
//!     run.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod execution;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use execution::engine::ExecutionEngine;
pub use worker::WorkerRegistry;
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "TaskDeck";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "TaskDeck");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("fetch", "Fetch", "io");
        assert_eq!(step.id, "fetch");
        assert_eq!(step.capability, "io");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new("demo", vec![Step::new("a", "A", "compute")]).unwrap();
        assert_eq!(workflow.len(), 1);
    }
}
