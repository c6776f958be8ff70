//! Workflow execution
//!
//! The engine, the per-step dispatch pipeline, retry policy, result
//! transformations, and the run event stream.

pub mod engine;
pub mod events;
pub mod retry;
pub mod step;
pub mod transform;

pub use engine::{EngineConfig, EngineError, EngineMetrics, ExecutionEngine, WorkflowRun};
pub use events::{ExecutionEvent, RunSummary};
pub use retry::RetryPolicy;
pub use step::{Dispatcher, SimulationExecutor, StepContext, StepError, TaskExecutor};
pub use transform::{apply_transforms, AggregateOp, Comparator, Transform, TransformError};
