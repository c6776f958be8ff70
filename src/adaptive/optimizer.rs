//! Performance optimizer
//!
//! One-time pre-run tuning, distinct from the controller's in-run
//! rebalancing: replaces step duration estimates with historical
//! averages from comparable past runs, then boosts the priority of
//! every step on the recomputed critical path.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info};
use uuid::Uuid;

use crate::workflow::{critical_path, DagError, StepState, Workflow};

/// How many comparable past runs inform the duration averages.
pub const HISTORY_WINDOW: usize = 100;

/// Priority increment applied to every critical-path step.
pub const CRITICAL_PATH_BOOST: i64 = 10;

/// Total records retained before the oldest are evicted.
const HISTORY_CAPACITY: usize = 1000;

/// Observed durations from one finished run.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub workflow_id: Uuid,
    pub step_count: usize,
    pub step_durations_ms: HashMap<String, u64>,
    pub finished_at: DateTime<Utc>,
}

/// Collects run history and tunes workflows against it.
#[derive(Debug, Default)]
pub struct PerformanceOptimizer {
    history: Mutex<Vec<ExecutionRecord>>,
}

impl PerformanceOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the observed step durations of a finished run.
    pub fn record(&self, workflow: &Workflow) {
        let durations: HashMap<String, u64> = workflow
            .steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .filter_map(|s| s.execution_time_ms.map(|ms| (s.id.clone(), ms)))
            .collect();
        if durations.is_empty() {
            return;
        }

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(ExecutionRecord {
            workflow_id: workflow.id,
            step_count: workflow.len(),
            step_durations_ms: durations,
            finished_at: Utc::now(),
        });
        if history.len() > HISTORY_CAPACITY {
            let excess = history.len() - HISTORY_CAPACITY;
            history.drain(..excess);
        }
    }

    /// Number of recorded runs.
    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Averages step durations across the most recent comparable runs
    /// (same step count, newest [`HISTORY_WINDOW`] of them).
    fn historical_averages(&self, step_count: usize) -> HashMap<String, u64> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut sums: HashMap<String, (u64, u64)> = HashMap::new();

        for record in history
            .iter()
            .rev()
            .filter(|r| r.step_count == step_count)
            .take(HISTORY_WINDOW)
        {
            for (id, ms) in &record.step_durations_ms {
                let entry = sums.entry(id.clone()).or_insert((0, 0));
                entry.0 += ms;
                entry.1 += 1;
            }
        }

        sums.into_iter()
            .map(|(id, (total, count))| (id, total / count))
            .collect()
    }

    /// Tunes a workflow before its run: overwrites duration estimates
    /// with historical averages where available, then boosts every step
    /// on the recomputed critical path.
    pub fn tune(&self, workflow: &mut Workflow) -> Result<(), DagError> {
        let averages = self.historical_averages(workflow.len());
        let mut adjusted = 0;
        for step in &mut workflow.steps {
            if let Some(&avg) = averages.get(&step.id) {
                debug!(
                    "step '{}': estimate {}ms -> historical {}ms",
                    step.id, step.estimated_duration_ms, avg
                );
                step.estimated_duration_ms = avg;
                adjusted += 1;
            }
        }

        let path = critical_path(workflow)?;
        for id in &path {
            if let Some(step) = workflow.get_step_mut(id) {
                step.priority_boost += CRITICAL_PATH_BOOST;
            }
        }

        if adjusted > 0 {
            info!(
                "tuned workflow '{}': {} estimates from history, {} critical-path steps boosted",
                workflow.name,
                adjusted,
                path.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;

    fn finished_workflow(durations: &[(&str, u64)]) -> Workflow {
        let steps = durations
            .iter()
            .map(|(id, _)| Step::new(*id, *id, "compute"))
            .collect();
        let mut wf = Workflow::new("hist", steps).unwrap();
        for (id, ms) in durations {
            let step = wf.get_step_mut(id).unwrap();
            step.state = StepState::Completed;
            step.execution_time_ms = Some(*ms);
        }
        wf
    }

    fn fresh_workflow() -> Workflow {
        Workflow::new(
            "next",
            vec![
                Step::new("a", "A", "compute").with_estimated_duration_ms(1),
                Step::new("b", "B", "compute").with_estimated_duration_ms(1),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_record_skips_runs_without_completed_steps() {
        let optimizer = PerformanceOptimizer::new();
        let wf = Workflow::new("empty-ish", vec![Step::new("a", "A", "compute")]).unwrap();
        optimizer.record(&wf);
        assert_eq!(optimizer.history_len(), 0);
    }

    #[test]
    fn test_tune_averages_comparable_runs() {
        let optimizer = PerformanceOptimizer::new();
        optimizer.record(&finished_workflow(&[("a", 100), ("b", 10)]));
        optimizer.record(&finished_workflow(&[("a", 300), ("b", 30)]));

        let mut wf = fresh_workflow();
        optimizer.tune(&mut wf).unwrap();

        assert_eq!(wf.get_step("a").unwrap().estimated_duration_ms, 200);
        assert_eq!(wf.get_step("b").unwrap().estimated_duration_ms, 20);
    }

    #[test]
    fn test_tune_ignores_runs_with_different_step_count() {
        let optimizer = PerformanceOptimizer::new();
        optimizer.record(&finished_workflow(&[("a", 500), ("b", 500), ("c", 500)]));

        let mut wf = fresh_workflow();
        optimizer.tune(&mut wf).unwrap();

        // No comparable history: estimates untouched
        assert_eq!(wf.get_step("a").unwrap().estimated_duration_ms, 1);
    }

    #[test]
    fn test_tune_boosts_critical_path() {
        let optimizer = PerformanceOptimizer::new();
        let mut wf = Workflow::new(
            "diamond",
            vec![
                Step::new("a", "A", "compute").with_estimated_duration_ms(10),
                Step::new("b", "B", "compute")
                    .depends_on("a")
                    .with_estimated_duration_ms(50),
                Step::new("c", "C", "compute")
                    .depends_on("a")
                    .with_estimated_duration_ms(5),
                Step::new("d", "D", "compute")
                    .depends_on("b")
                    .depends_on("c")
                    .with_estimated_duration_ms(10),
            ],
        )
        .unwrap();
        optimizer.tune(&mut wf).unwrap();

        // a -> b -> d is the longest chain
        assert_eq!(wf.get_step("a").unwrap().priority_boost, CRITICAL_PATH_BOOST);
        assert_eq!(wf.get_step("b").unwrap().priority_boost, CRITICAL_PATH_BOOST);
        assert_eq!(wf.get_step("d").unwrap().priority_boost, CRITICAL_PATH_BOOST);
        assert_eq!(wf.get_step("c").unwrap().priority_boost, 0);
    }

    #[test]
    fn test_window_uses_most_recent_runs() {
        let optimizer = PerformanceOptimizer::new();
        // One stale outlier followed by a full window of steady runs
        optimizer.record(&finished_workflow(&[("a", 1_000_000), ("b", 1)]));
        for _ in 0..HISTORY_WINDOW {
            optimizer.record(&finished_workflow(&[("a", 100), ("b", 10)]));
        }

        let mut wf = fresh_workflow();
        optimizer.tune(&mut wf).unwrap();
        assert_eq!(wf.get_step("a").unwrap().estimated_duration_ms, 100);
    }

    #[test]
    fn test_history_capacity_evicts_oldest() {
        let optimizer = PerformanceOptimizer::new();
        for _ in 0..1100 {
            optimizer.record(&finished_workflow(&[("a", 10)]));
        }
        assert_eq!(optimizer.history_len(), 1000);
    }
}
