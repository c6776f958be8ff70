//! DAG Queries
//!
//! Dependency-aware grouping and critical-path analysis over a workflow's
//! steps. Both are pure queries: they read step states and estimates but
//! never mutate the workflow.

use std::collections::{HashMap, HashSet, VecDeque};

use log::warn;
use thiserror::Error;

use super::model::{StepState, Workflow};

/// Error raised by DAG analysis.
///
/// Workflows are validated acyclic at construction, so this only fires
/// for hand-assembled workflows that bypassed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("cannot compute critical path: cyclic dependencies (involving step '{0}')")]
    CyclicDependency(String),
}

/// Greedily layers pending steps into co-runnable execution groups.
///
/// Each round collects every still-ungrouped pending step whose
/// dependencies are satisfied by previously formed groups (or by already
/// completed steps) and which is pairwise parallel-compatible with every
/// step already in the current group. Groups preserve declaration order.
///
/// If a round produces no group members while steps remain (a deadlocked
/// resource conflict on a hand-assembled graph), the remaining steps are
/// scheduled one per group as a safety net rather than dropped.
pub fn execution_groups(workflow: &Workflow) -> Vec<Vec<String>> {
    // Already-completed steps satisfy dependencies from the start, so
    // grouping stays correct when called mid-run.
    let mut satisfied: HashSet<&str> = workflow
        .steps
        .iter()
        .filter(|s| s.state == StepState::Completed)
        .map(|s| s.id.as_str())
        .collect();

    let mut remaining: Vec<&super::model::Step> = workflow
        .steps
        .iter()
        .filter(|s| s.state == StepState::Pending)
        .collect();

    let mut groups: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let mut group: Vec<&super::model::Step> = Vec::new();

        for &step in &remaining {
            let deps_satisfied = step.dependency_ids().all(|dep| satisfied.contains(dep));
            let compatible = group.iter().all(|&g| step.can_run_in_parallel(g));
            if deps_satisfied && compatible {
                group.push(step);
            }
        }

        if group.is_empty() {
            warn!(
                "execution grouping stalled with {} steps remaining; falling back to one step per group",
                remaining.len()
            );
            for step in remaining {
                groups.push(vec![step.id.clone()]);
            }
            break;
        }

        let group_ids: HashSet<&str> = group.iter().map(|s| s.id.as_str()).collect();
        remaining.retain(|s| !group_ids.contains(s.id.as_str()));
        satisfied.extend(group_ids);
        groups.push(group.iter().map(|s| s.id.clone()).collect());
    }

    groups
}

/// Computes the critical path: the dependency chain with the greatest
/// cumulative estimated duration.
///
/// For each step, `longest(step) = max(longest(dep)) + step.estimate`,
/// evaluated iteratively in topological order (memoized by construction,
/// no recursion). Fails fast on a cycle instead of looping.
pub fn critical_path(workflow: &Workflow) -> Result<Vec<String>, DagError> {
    if workflow.steps.is_empty() {
        return Ok(Vec::new());
    }

    let order = topological_order(workflow)?;

    let mut longest: HashMap<&str, u64> = HashMap::new();
    let mut best_pred: HashMap<&str, Option<&str>> = HashMap::new();

    for id in &order {
        let step = match workflow.get_step(id) {
            Some(s) => s,
            None => continue,
        };
        let (pred, base) = step
            .dependency_ids()
            .map(|dep| (dep, longest.get(dep).copied().unwrap_or(0)))
            .max_by_key(|&(_, len)| len)
            .map(|(dep, len)| (Some(dep), len))
            .unwrap_or((None, 0));

        longest.insert(id, base + step.estimated_duration_ms);
        best_pred.insert(id, pred);
    }

    // Walk back from the globally longest endpoint.
    let end = match order
        .iter()
        .max_by_key(|id| longest.get(id.as_str()).copied().unwrap_or(0))
    {
        Some(id) => id.as_str(),
        None => return Ok(Vec::new()),
    };

    let mut path = Vec::new();
    let mut current = Some(end);
    while let Some(id) = current {
        path.push(id.to_string());
        current = best_pred.get(id).copied().flatten();
    }
    path.reverse();
    Ok(path)
}

/// Total estimated duration along the critical path, in milliseconds.
pub fn critical_path_length_ms(workflow: &Workflow) -> Result<u64, DagError> {
    Ok(critical_path(workflow)?
        .iter()
        .filter_map(|id| workflow.get_step(id))
        .map(|s| s.estimated_duration_ms)
        .sum())
}

/// Kahn's algorithm over every step (regardless of state), returning ids
/// in topological order as `&str` borrowed from the workflow.
fn topological_order(workflow: &Workflow) -> Result<Vec<String>, DagError> {
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

    let mut order = Vec::with_capacity(workflow.steps.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
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

    if order.len() != workflow.steps.len() {
        let culprit = workflow
            .steps
            .iter()
            .find(|s| in_degree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        return Err(DagError::CyclicDependency(culprit));
    }

    Ok(order)
}
