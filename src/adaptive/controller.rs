//! Adaptive controller
//!
//! In-run rebalancing for the adaptive strategy. Runs once per
//! scheduling iteration, before dispatch:
//!
//! - **Priority escalation**: under high total load, bump the priority
//!   boost of ready steps so short critical work jumps the queue
//! - **Bottleneck rerouting**: steps routed at an overloaded worker are
//!   redirected to a calmer worker with the same capability
//!
//! Rerouting only touches a step's `assigned_worker`; the declared
//! `capability` is never rewritten.

use log::{debug, info};

use crate::worker::{pick_worker, WorkerInfo};
use crate::workflow::Workflow;

/// Load-pressure ratio above which ready steps get escalated.
pub const LOAD_PRESSURE_RATIO: f64 = 0.8;

/// Escalation stops once a step's boost reaches this value.
pub const PRIORITY_BOOST_CEILING: i64 = 5;

/// A caller-supplied rebalancing hook, run after the built-in
/// adjustments each iteration.
pub type AdaptationRule = Box<dyn Fn(&mut Workflow, &[WorkerInfo]) + Send + Sync>;

/// Applies pre-dispatch adjustments to a running workflow.
#[derive(Default)]
pub struct AdaptiveController {
    rules: Vec<AdaptationRule>,
}

impl AdaptiveController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom rebalancing rule.
    pub fn add_rule(&mut self, rule: AdaptationRule) {
        self.rules.push(rule);
    }

    /// One adjustment pass: escalation, rerouting, then custom rules.
    /// `capacity` is the engine's configured concurrent-workflow limit.
    pub fn adjust(&self, workflow: &mut Workflow, workers: &[WorkerInfo], capacity: usize) {
        self.escalate_priorities(workflow, workers, capacity);
        self.reroute_bottlenecks(workflow, workers);
        for rule in &self.rules {
            rule(workflow, workers);
        }
    }

    /// Bumps the boost of every ready step while total worker load
    /// exceeds 80% of the engine's concurrency capacity.
    fn escalate_priorities(&self, workflow: &mut Workflow, workers: &[WorkerInfo], capacity: usize) {
        if capacity == 0 {
            return;
        }
        let load: usize = workers.iter().map(|w| w.current_load).sum();
        if (load as f64) <= LOAD_PRESSURE_RATIO * capacity as f64 {
            return;
        }

        let ready: Vec<String> = workflow.ready_steps().iter().map(|s| s.id.clone()).collect();
        let mut escalated = 0;
        for id in ready {
            if let Some(step) = workflow.get_step_mut(&id) {
                if step.priority_boost < PRIORITY_BOOST_CEILING {
                    step.priority_boost += 1;
                    escalated += 1;
                }
            }
        }
        if escalated > 0 {
            info!(
                "load {}/{} above pressure threshold, escalated {} ready steps",
                load, capacity, escalated
            );
        }
    }

    /// Redirects ready steps whose prospective worker is a bottleneck
    /// to a non-bottleneck alternative with the same capabilities.
    fn reroute_bottlenecks(&self, workflow: &mut Workflow, workers: &[WorkerInfo]) {
        let ready: Vec<String> = workflow.ready_steps().iter().map(|s| s.id.clone()).collect();

        for id in ready {
            let Some(step) = workflow.get_step(&id) else { continue };
            let mut required: Vec<&str> = vec![step.capability.as_str()];
            required.extend(step.extra_capabilities.iter().map(String::as_str));

            let Some(prospective) = pick_worker(workers, &required, step.assigned_worker.as_deref())
            else {
                continue;
            };
            if !prospective.is_bottleneck() {
                continue;
            }

            let alternate = workers
                .iter()
                .filter(|w| w.id != prospective.id && !w.is_bottleneck())
                .find(|w| w.is_eligible(&required));

            if let Some(alt) = alternate {
                debug!(
                    "rerouting step '{}' away from bottleneck '{}' to '{}'",
                    id, prospective.id, alt.id
                );
                let target = alt.id.clone();
                if let Some(step) = workflow.get_step_mut(&id) {
                    step.assigned_worker = Some(target);
                }
            }
        }
    }
}
