//! Execution engine
//!
//! Owns the active/completed workflow sets and drives runs under one of
//! four strategies:
//!
//! - **Sequential** — declaration order, one step at a time, retry in place
//! - **Parallel** — dependency-layered groups, each drained in bounded waves
//! - **Adaptive** — continuous ready-set scheduling with pre-dispatch
//!   rebalancing, woken by step completions rather than polling
//! - **Pipeline** — declaration order, threading a shared data map forward
//!
//! Every run emits an ordered event stream: one `WorkflowStarted`,
//! interleaved step events, and exactly one terminal `WorkflowCompleted`
//! even when the run failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::adaptive::{AdaptationRule, AdaptiveController, PerformanceOptimizer};
use crate::execution::events::{ExecutionEvent, RunSummary};
use crate::execution::step::{Dispatcher, TaskExecutor};
use crate::workflow::{
    execution_groups, DagError, ExecutionStrategy, StepState, ValidationError, Workflow,
    WorkflowSpec, WorkflowState,
};
use crate::worker::WorkerRegistry;

/// Engine-level failures, as opposed to per-step ones.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow {0}")]
    UnknownWorkflow(Uuid),
    #[error("active workflow limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error("workflow {workflow_id} finished in state {state:?} with {error_count} errors")]
    RunFailed {
        workflow_id: Uuid,
        state: WorkflowState,
        error_count: usize,
    },
    #[error("run task failed: {0}")]
    RunTask(String),
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on workflows held in the active set at once.
    pub max_concurrent_workflows: usize,
    /// Run the performance optimizer before adaptive runs.
    pub optimize_adaptive_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            optimize_adaptive_runs: true,
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub active_workflows: usize,
    pub completed_workflows: usize,
    pub total_runs: u64,
    pub worker_count: usize,
    pub total_worker_load: usize,
    pub worker_loads: HashMap<String, usize>,
}

/// Handle to one in-flight run: the consumable event stream plus the
/// join handle for the final verdict.
#[derive(Debug)]
pub struct WorkflowRun {
    pub workflow_id: Uuid,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    handle: JoinHandle<Result<(), EngineError>>,
}

impl WorkflowRun {
    /// Next event, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Waits for the run to finish, re-raising a workflow-level failure
    /// after the terminal event has been emitted.
    pub async fn wait(self) -> Result<(), EngineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(EngineError::RunTask(join_err.to_string())),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn TaskExecutor>,
    controller: Mutex<AdaptiveController>,
    optimizer: PerformanceOptimizer,
    active: RwLock<HashMap<Uuid, Arc<RwLock<Workflow>>>>,
    completed: RwLock<HashMap<Uuid, Workflow>>,
    total_runs: AtomicU64,
}

/// The workflow execution engine. Cheap to clone and share.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: Arc::new(WorkerRegistry::new()),
                executor,
                controller: Mutex::new(AdaptiveController::new()),
                optimizer: PerformanceOptimizer::new(),
                active: RwLock::new(HashMap::new()),
                completed: RwLock::new(HashMap::new()),
                total_runs: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a worker with the engine's registry.
    pub fn register_worker(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        max_concurrent: usize,
    ) {
        self.inner.registry.register(id, capabilities, max_concurrent);
    }

    /// Registers a custom adaptive rebalancing rule.
    pub fn add_adaptation_rule(&self, rule: AdaptationRule) {
        self.inner
            .controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_rule(rule);
    }

    /// Validates a specification and admits the workflow to the active
    /// set, returning its id.
    pub async fn create_workflow(&self, spec: WorkflowSpec) -> Result<Uuid, EngineError> {
        let workflow = Workflow::from_spec(spec)?;
        self.submit(workflow).await
    }

    /// Admits an already-built workflow to the active set.
    pub async fn submit(&self, workflow: Workflow) -> Result<Uuid, EngineError> {
        let mut active = self.inner.active.write().await;
        if active.len() >= self.inner.config.max_concurrent_workflows {
            return Err(EngineError::CapacityExceeded {
                limit: self.inner.config.max_concurrent_workflows,
            });
        }
        let id = workflow.id;
        info!(
            "workflow '{}' ({}) admitted with {} steps, strategy {:?}",
            workflow.name,
            id,
            workflow.len(),
            workflow.strategy
        );
        active.insert(id, Arc::new(RwLock::new(workflow)));
        Ok(id)
    }

    /// Starts executing an active workflow. Extra `context` entries are
    /// merged into the workflow's input context first.
    ///
    /// Returns immediately with a [`WorkflowRun`] handle; the run itself
    /// proceeds on a spawned task.
    pub async fn execute_workflow(
        &self,
        id: Uuid,
        context: HashMap<String, Value>,
        session_id: Option<String>,
    ) -> Result<WorkflowRun, EngineError> {
        let workflow = {
            let active = self.inner.active.read().await;
            Arc::clone(active.get(&id).ok_or(EngineError::UnknownWorkflow(id))?)
        };
        self.inner.total_runs.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.executor),
            tx.clone(),
        );

        let (name, strategy, timeout) = {
            let mut wf = workflow.write().await;
            wf.state = WorkflowState::Initializing;
            wf.context.extend(context);
            (wf.name.clone(), wf.strategy, wf.timeout)
        };

        if strategy == ExecutionStrategy::Adaptive && self.inner.config.optimize_adaptive_runs {
            let mut wf = workflow.write().await;
            self.inner.optimizer.tune(&mut wf)?;
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            {
                let mut wf = workflow.write().await;
                wf.state = WorkflowState::Running;
                wf.started_at = Some(Utc::now());
            }
            let _ = tx.send(ExecutionEvent::WorkflowStarted {
                workflow_id: id,
                name,
            });

            let run = engine.run_strategy(strategy, &dispatcher, &workflow);
            let timed_out = match timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.is_err(),
                None => {
                    run.await;
                    false
                }
            };

            engine
                .finalize(id, session_id, &workflow, &tx, timed_out)
                .await
        });

        Ok(WorkflowRun {
            workflow_id: id,
            events: rx,
            handle,
        })
    }

    /// Cancels an active workflow. Returns false for unknown or
    /// already-finished ids.
    pub async fn cancel_workflow(&self, id: Uuid) -> bool {
        let Some(workflow) = self.inner.active.write().await.remove(&id) else {
            return false;
        };
        let snapshot = {
            let mut wf = workflow.write().await;
            wf.state = WorkflowState::Cancelled;
            wf.finished_at = Some(Utc::now());
            for step in &mut wf.steps {
                if step.state == StepState::Pending {
                    step.state = StepState::Cancelled;
                }
            }
            wf.clone()
        };
        warn!("workflow '{}' ({}) cancelled", snapshot.name, id);
        self.inner.completed.write().await.insert(id, snapshot);
        true
    }

    /// Current snapshot of a workflow, active or completed.
    pub async fn workflow_status(&self, id: Uuid) -> Option<Workflow> {
        if let Some(workflow) = self.inner.active.read().await.get(&id) {
            return Some(workflow.read().await.clone());
        }
        self.inner.completed.read().await.get(&id).cloned()
    }

    /// Engine counters.
    pub async fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            active_workflows: self.inner.active.read().await.len(),
            completed_workflows: self.inner.completed.read().await.len(),
            total_runs: self.inner.total_runs.load(Ordering::Relaxed),
            worker_count: self.inner.registry.worker_count(),
            total_worker_load: self.inner.registry.total_load(),
            worker_loads: self.inner.registry.loads(),
        }
    }

    async fn run_strategy(
        &self,
        strategy: ExecutionStrategy,
        dispatcher: &Dispatcher,
        workflow: &Arc<RwLock<Workflow>>,
    ) {
        match strategy {
            ExecutionStrategy::Sequential => self.run_sequential(dispatcher, workflow).await,
            ExecutionStrategy::Parallel => self.run_parallel(dispatcher, workflow).await,
            ExecutionStrategy::Adaptive => self.run_adaptive(dispatcher, workflow).await,
            ExecutionStrategy::Pipeline => self.run_pipeline(dispatcher, workflow).await,
        }
    }

    /// Declaration order, one step at a time. Dependency order is the
    /// caller's contract here and is not re-verified.
    async fn run_sequential(&self, dispatcher: &Dispatcher, workflow: &Arc<RwLock<Workflow>>) {
        let step_count = workflow.read().await.len();
        for index in 0..step_count {
            if workflow.read().await.state == WorkflowState::Cancelled {
                break;
            }
            if dispatcher.run_step(workflow, index, None).await.is_err()
                && !workflow.read().await.auto_retry
            {
                warn!("sequential run aborted after step {} failed", index);
                break;
            }
        }
    }

    /// Dependency-layered groups, computed once up front. Each group is
    /// fully drained in waves of at most `max_parallel_steps` before the
    /// next group starts.
    async fn run_parallel(&self, dispatcher: &Dispatcher, workflow: &Arc<RwLock<Workflow>>) {
        let (groups, max_parallel, auto_retry) = {
            let wf = workflow.read().await;
            (
                execution_groups(&wf),
                wf.max_parallel_steps,
                wf.auto_retry,
            )
        };

        for (group_no, group) in groups.iter().enumerate() {
            if workflow.read().await.state == WorkflowState::Cancelled {
                break;
            }
            // Earlier groups may have left a dependency short of
            // Completed (retries exhausted, timeout). Such members are
            // skipped and stay Pending rather than run out of order.
            let indices: Vec<usize> = {
                let wf = workflow.read().await;
                let completed = wf.completed_ids();
                group
                    .iter()
                    .filter_map(|id| wf.steps.iter().position(|s| &s.id == id))
                    .filter(|&index| {
                        let step = &wf.steps[index];
                        if step.state == StepState::Pending && step.is_ready(&completed) {
                            true
                        } else {
                            debug!("skipping step '{}': dependencies incomplete", step.id);
                            false
                        }
                    })
                    .collect()
            };
            debug!(
                "parallel group {} of {}: {} steps in waves of {}",
                group_no + 1,
                groups.len(),
                indices.len(),
                max_parallel
            );

            let mut group_failed = false;
            for wave in indices.chunks(max_parallel.max(1)) {
                let mut tasks = JoinSet::new();
                for &index in wave {
                    let dispatcher = dispatcher.clone();
                    let workflow = Arc::clone(workflow);
                    tasks.spawn(async move {
                        dispatcher.run_step(&workflow, index, None).await.is_err()
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    if joined.unwrap_or(true) {
                        group_failed = true;
                    }
                }
            }

            if group_failed && !auto_retry {
                warn!("parallel run aborted after a failure in group {}", group_no + 1);
                break;
            }
        }
    }

    /// Continuous ready-set scheduling. Each iteration runs the adaptive
    /// controller against a fresh worker snapshot, launches ready steps
    /// up to the parallelism cap, then sleeps until a step completes.
    async fn run_adaptive(&self, dispatcher: &Dispatcher, workflow: &Arc<RwLock<Workflow>>) {
        let mut inflight: JoinSet<bool> = JoinSet::new();

        loop {
            let (cancelled, all_terminal, auto_retry) = {
                let wf = workflow.read().await;
                (
                    wf.state == WorkflowState::Cancelled,
                    wf.all_steps_terminal(),
                    wf.auto_retry,
                )
            };
            if cancelled || all_terminal {
                break;
            }

            // Adjust and launch under one write lock so the controller
            // sees the same ready set the launcher uses.
            {
                let snapshot = self.inner.registry.snapshot();
                let mut wf = workflow.write().await;
                self.inner
                    .controller
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .adjust(&mut wf, &snapshot, self.inner.config.max_concurrent_workflows);

                let budget = wf.max_parallel_steps.saturating_sub(inflight.len());
                let ready: Vec<String> = wf
                    .ready_steps()
                    .into_iter()
                    .take(budget)
                    .map(|s| s.id.clone())
                    .collect();

                for id in ready {
                    let Some(index) = wf.steps.iter().position(|s| s.id == id) else {
                        continue;
                    };
                    // Claim the step now so the next iteration's ready
                    // set cannot launch it twice.
                    wf.steps[index].state = StepState::Running;
                    let dispatcher = dispatcher.clone();
                    let workflow = Arc::clone(workflow);
                    inflight.spawn(async move {
                        dispatcher.run_step(&workflow, index, None).await.is_err()
                    });
                }
            }

            if inflight.is_empty() {
                // Nothing running and nothing ready: remaining steps are
                // blocked behind failures.
                debug!("adaptive run stalled with non-terminal steps remaining");
                break;
            }

            // Wake on the next completion instead of polling.
            if let Some(joined) = inflight.join_next().await {
                if joined.unwrap_or(true) && !auto_retry {
                    warn!("adaptive run aborting after a step failure");
                    break;
                }
            }
        }

        while inflight.join_next().await.is_some() {}
    }

    /// Declaration order with a shared data map threaded forward. Any
    /// failure aborts immediately, with no retry.
    async fn run_pipeline(&self, dispatcher: &Dispatcher, workflow: &Arc<RwLock<Workflow>>) {
        let step_count = workflow.read().await.len();
        let mut pipeline_data: HashMap<String, Value> = HashMap::new();

        for index in 0..step_count {
            if workflow.read().await.state == WorkflowState::Cancelled {
                break;
            }
            match dispatcher.dispatch(workflow, index, Some(&pipeline_data)).await {
                Ok(value) => {
                    let step_id = workflow.read().await.steps[index].id.clone();
                    match value {
                        Value::Object(map) => pipeline_data.extend(map),
                        other => {
                            pipeline_data.insert(step_id, other);
                        }
                    }
                }
                Err(err) => {
                    warn!("pipeline aborted at step {}: {}", index, err);
                    break;
                }
            }
        }
    }

    /// Computes the final state, emits the terminal event, records the
    /// run for the optimizer, and moves the workflow to the completed
    /// set. Runs for every outcome, including cancellation.
    async fn finalize(
        &self,
        id: Uuid,
        session_id: Option<String>,
        workflow: &Arc<RwLock<Workflow>>,
        events: &mpsc::UnboundedSender<ExecutionEvent>,
        timed_out: bool,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut wf = workflow.write().await;
            if !wf.state.is_terminal() {
                wf.state = if timed_out {
                    WorkflowState::TimedOut
                } else if wf.steps.iter().all(|s| s.state == StepState::Completed) {
                    WorkflowState::Completed
                } else {
                    WorkflowState::Failed
                };
            }
            wf.finished_at = Some(Utc::now());
            wf.current_step = None;
            wf.clone()
        };

        let total_ms = match (snapshot.started_at, snapshot.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        let completed_steps = snapshot
            .steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .count();
        let summary = RunSummary {
            state: snapshot.state,
            completed_steps,
            total_steps: snapshot.len(),
            success_rate: snapshot.success_rate(),
            total_execution_time_ms: total_ms,
        };
        info!(
            "workflow '{}' ({}) finished in state {:?}: {}/{} steps, {:.0}ms",
            snapshot.name, id, snapshot.state, completed_steps, snapshot.len(), total_ms
        );

        let _ = events.send(ExecutionEvent::WorkflowCompleted {
            workflow_id: id,
            session_id,
            summary,
        });

        self.inner.optimizer.record(&snapshot);

        // A cancelled run was already moved out; overwrite its snapshot
        // with the settled one.
        self.inner.active.write().await.remove(&id);
        let state = snapshot.state;
        let error_count = snapshot.errors.len();
        self.inner.completed.write().await.insert(id, snapshot);

        if state == WorkflowState::Completed || state == WorkflowState::Cancelled {
            Ok(())
        } else {
            Err(EngineError::RunFailed {
                workflow_id: id,
                state,
                error_count,
            })
        }
    }
}
