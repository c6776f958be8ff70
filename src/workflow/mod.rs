//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating capability-scheduled workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow, specs, states)
//! - [`dag`]: Execution grouping and critical-path analysis
//! - [`validator`]: Validation rules and cycle detection
//! - [`parser`]: YAML spec loading

pub mod dag;
pub mod model;
pub mod parser;
pub mod validator;

pub use dag::{critical_path, critical_path_length_ms, execution_groups, DagError};
pub use model::{
    Dependency, DependencyKind, ExecutionStrategy, ResourceRequirements, Step, StepSpec,
    StepState, Workflow, WorkflowSpec, WorkflowState,
};
pub use parser::{load_workflow, parse_workflow, ParseError};
pub use validator::{validate_workflow, ValidationError};
