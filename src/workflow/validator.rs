//! Workflow Validation
//!
//! Synchronous validation run at construction time:
//! - Step field validation (non-empty ids, names, capabilities)
//! - Reference integrity (every dependency points at a real step)
//! - Dependency graph validation (no cycles, via Kahn's algorithm)
//!
//! Cyclic graphs are rejected here so the scheduler never has to guard
//! against infinite recursion or a permanently stuck ready set.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;
use thiserror::Error;

use super::model::Workflow;

/// Validation error raised while building a workflow from a spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("workflow name is empty")]
    EmptyWorkflowName,

    #[error("step has an empty or whitespace-only id")]
    EmptyStepId,

    #[error("step '{0}' has an empty name")]
    EmptyStepName(String),

    #[error("step '{0}' has no capability")]
    EmptyCapability(String),

    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownDependency { step: String, reference: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("workflow contains cyclic dependencies (involving step '{0}')")]
    CyclicDependency(String),
}

/// Validates the entire workflow structure.
///
/// Performs the following checks, stopping at the first failure:
/// 1. Workflow name and step list are non-empty
/// 2. Step ids, names and capabilities are non-empty
/// 3. No duplicate step ids
/// 4. All dependency references point to existing steps
/// 5. No self-dependencies and no cycles
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ValidationError> {
    if workflow.name.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowName);
    }

    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(ValidationError::EmptyStepId);
        }
        if step.name.trim().is_empty() {
            return Err(ValidationError::EmptyStepName(step.id.clone()));
        }
        if step.capability.trim().is_empty() {
            return Err(ValidationError::EmptyCapability(step.id.clone()));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        for dep in step.dependency_ids() {
            if dep == step.id {
                return Err(ValidationError::SelfDependency(step.id.clone()));
            }
            if !seen_ids.contains(dep) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    reference: dep.to_string(),
                });
            }
        }
    }

    check_acyclic(workflow)?;

    debug!(
        "workflow '{}' validated: {} steps",
        workflow.name,
        workflow.steps.len()
    );
    Ok(())
}

/// Detects dependency cycles using Kahn's algorithm.
///
/// Steps are peeled off in topological order; any step left with a
/// non-zero in-degree afterwards sits on a cycle.
fn check_acyclic(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in &workflow.steps {
        in_degree.insert(step.id.as_str(), step.dependencies.len());
        for dep in step.dependency_ids() {
            dependents.entry(dep).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = workflow
        .steps
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.id.as_str())
        .collect();

    let mut visited = 0usize;
    while let Some(current) = queue.pop_front() {
        visited += 1;
        if let Some(next) = dependents.get(current) {
            for &succ in next {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    if visited != workflow.steps.len() {
        // Name a step on the cycle for the error message (first in
        // declaration order with unresolved dependencies).
        let culprit = workflow
            .steps
            .iter()
            .find(|s| in_degree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        return Err(ValidationError::CyclicDependency(culprit));
    }

    Ok(())
}
