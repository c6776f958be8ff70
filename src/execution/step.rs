//! Step dispatch
//!
//! The per-step execution pipeline shared by every strategy:
//! mark Running → lease a worker → call the task executor under the
//! step timeout → apply transforms → record the outcome and emit
//! events. Retry wrapping lives here too, so the strategies only decide
//! *which* steps run *when*.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::execution::events::ExecutionEvent;
use crate::execution::retry::RetryPolicy;
use crate::execution::transform::{apply_transforms, TransformError};
use crate::workflow::{StepState, Workflow};
use crate::worker::WorkerRegistry;

/// Why one dispatch attempt failed.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("no suitable worker for capability '{capability}'")]
    NoSuitableWorker { capability: String },
    #[error("step execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
}

impl StepError {
    /// Short machine-readable kind for event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::NoSuitableWorker { .. } => "no_suitable_worker",
            StepError::Execution(_) => "execution",
            StepError::Transform(_) => "transform",
            StepError::Timeout(_) => "timeout",
        }
    }
}

/// Everything an executor sees about the step it runs. The input map
/// merges the workflow context, shared data, and prior step results
/// (nested under `"results"`), with any pipeline data layered on top.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub capability: String,
    pub attempt: u32,
    pub timeout: Duration,
    pub input: HashMap<String, Value>,
}

/// The external execution capability. The engine treats payloads
/// opaquely beyond the step's declared transforms.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> Result<Value, String>;
}

/// Built-in executor for demos and dry runs: sleeps a scaled-down
/// fraction of the step's estimated duration and returns a small JSON
/// payload. Steps whose context carries `"fail": true` report failure,
/// which exercises the retry path.
#[derive(Debug, Clone, Default)]
pub struct SimulationExecutor {
    /// Divisor applied to estimated durations; 0 means no sleep at all.
    pub time_scale: u64,
}

impl SimulationExecutor {
    pub fn new(time_scale: u64) -> Self {
        Self { time_scale }
    }
}

#[async_trait]
impl TaskExecutor for SimulationExecutor {
    async fn execute(&self, ctx: StepContext) -> Result<Value, String> {
        if self.time_scale > 0 {
            let estimated = ctx
                .input
                .get("estimated_duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(estimated / self.time_scale)).await;
        }
        if ctx.input.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(format!("simulated failure in '{}'", ctx.step_id));
        }
        Ok(serde_json::json!({
            "step": ctx.step_id,
            "attempt": ctx.attempt,
            "status": "simulated",
        }))
    }
}

/// Executes single steps against the worker registry. Cheap to clone;
/// one dispatcher is shared by all concurrent step tasks of a run.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn TaskExecutor>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executor: Arc<dyn TaskExecutor>,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Self {
        Self {
            registry,
            executor,
            events,
            retry: RetryPolicy::new(),
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    /// Runs one step with its retry policy: failed attempts are retried
    /// with linear backoff until the step's budget is exhausted.
    pub async fn run_step(
        &self,
        workflow: &Arc<RwLock<Workflow>>,
        step_index: usize,
        pipeline_data: Option<&HashMap<String, Value>>,
    ) -> Result<Value, StepError> {
        loop {
            match self.dispatch(workflow, step_index, pipeline_data).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let (step_id, attempts, retry, delay) = {
                        let wf = workflow.read().await;
                        let step = &wf.steps[step_index];
                        let retry = self.retry.should_retry(step, step.attempts);
                        let delay = self.retry.backoff(step, step.attempts);
                        (step.id.clone(), step.attempts, retry, delay)
                    };
                    if !retry {
                        return Err(err);
                    }
                    info!(
                        "retrying step '{}' (attempt {} failed), waiting {:?}",
                        step_id, attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One dispatch attempt, no retry. Records the outcome on the step
    /// and emits the matching events.
    pub async fn dispatch(
        &self,
        workflow: &Arc<RwLock<Workflow>>,
        step_index: usize,
        pipeline_data: Option<&HashMap<String, Value>>,
    ) -> Result<Value, StepError> {
        // Phase 1: mark Running and capture the context. The lock is
        // released before any await.
        let (ctx, required, preferred, transforms, timeout) = {
            let mut wf = workflow.write().await;
            let workflow_id = wf.id;
            let mut input = wf.context.clone();
            input.extend(wf.shared_data.clone());
            input.insert(
                "results".to_string(),
                serde_json::to_value(&wf.results).unwrap_or(Value::Null),
            );
            if let Some(data) = pipeline_data {
                input.extend(data.clone());
            }
            wf.current_step = Some(wf.steps[step_index].id.clone());

            let step = &mut wf.steps[step_index];
            step.state = StepState::Running;
            step.started_at = Some(Utc::now());
            input.insert(
                "estimated_duration_ms".to_string(),
                Value::from(step.estimated_duration_ms),
            );

            let mut required: Vec<String> = vec![step.capability.clone()];
            required.extend(step.extra_capabilities.iter().cloned());

            let ctx = StepContext {
                workflow_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                capability: step.capability.clone(),
                attempt: step.attempts + 1,
                timeout: step.timeout,
                input,
            };
            (
                ctx,
                required,
                step.assigned_worker.clone(),
                step.transforms.clone(),
                step.timeout,
            )
        };

        debug!(
            "dispatching step '{}' (attempt {})",
            ctx.step_id, ctx.attempt
        );

        // Phase 2: lease a worker.
        let required_refs: Vec<&str> = required.iter().map(String::as_str).collect();
        let lease = match self.registry.select(&required_refs, preferred.as_deref()) {
            Some(lease) => lease,
            None => {
                warn!(
                    "no suitable worker for step '{}' (capability '{}')",
                    ctx.step_id, ctx.capability
                );
                let err = StepError::NoSuitableWorker {
                    capability: ctx.capability.clone(),
                };
                self.record_failure(workflow, step_index, None, &err).await;
                return Err(err);
            }
        };
        let worker_id = lease.worker_id().to_string();

        self.emit(ExecutionEvent::StepStarted {
            worker: worker_id.clone(),
            step_index,
            step_id: ctx.step_id.clone(),
        });

        // Phase 3: execute under the step timeout. The lease drops at
        // the end of this scope on every path.
        let step_id = ctx.step_id.clone();
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(ctx)).await {
            Ok(Ok(value)) => apply_transforms(value, &transforms).map_err(StepError::from),
            Ok(Err(message)) => Err(StepError::Execution(message)),
            Err(_) => Err(StepError::Timeout(timeout)),
        };
        drop(lease);

        // Phase 4: record the outcome.
        match outcome {
            Ok(value) => {
                let mut wf = workflow.write().await;
                let now = Utc::now();
                let step = &mut wf.steps[step_index];
                step.state = StepState::Completed;
                step.finished_at = Some(now);
                if let Some(started) = step.started_at {
                    let elapsed = (now - started).num_milliseconds().max(0) as u64;
                    step.execution_time_ms = Some(elapsed);
                    step.metrics
                        .insert("execution_time_ms".to_string(), elapsed as f64);
                }
                step.result = Some(value.clone());
                let publish = step.publish_as.clone();
                wf.results.insert(step_id.clone(), value.clone());
                if let Some(key) = publish {
                    wf.shared_data.insert(key, value.clone());
                }
                drop(wf);

                info!("step '{}' completed on worker '{}'", step_id, worker_id);
                self.emit(ExecutionEvent::StepCompleted {
                    worker: worker_id,
                    step_index,
                    output: value.clone(),
                });
                Ok(value)
            }
            Err(err) => {
                self.record_failure(workflow, step_index, Some(worker_id), &err)
                    .await;
                Err(err)
            }
        }
    }

    /// Marks the step failed (timed out once retries are spent), bumps
    /// its attempt counter,
    /// appends to the workflow error log, and emits a `StepError` event.
    async fn record_failure(
        &self,
        workflow: &Arc<RwLock<Workflow>>,
        step_index: usize,
        worker: Option<String>,
        err: &StepError,
    ) {
        let step_id = {
            let mut wf = workflow.write().await;
            let now = Utc::now();
            let step = &mut wf.steps[step_index];
            step.attempts += 1;
            step.finished_at = Some(now);
            if let Some(started) = step.started_at {
                step.execution_time_ms = Some((now - started).num_milliseconds().max(0) as u64);
            }
            // A retried attempt re-enters Running, and only Failed may
            // do that. TimedOut is reserved for the attempt that spends
            // the retry budget.
            let budget_left = self.retry.should_retry(step, step.attempts);
            step.state = match err {
                StepError::Timeout(_) if !budget_left => StepState::TimedOut,
                _ => StepState::Failed,
            };
            step.error = Some(err.to_string());
            let step_id = step.id.clone();
            let entry = format!("step '{}': {}", step_id, err);
            wf.errors.push(entry);
            step_id
        };

        error!("step '{}' failed: {}", step_id, err);
        self.emit(ExecutionEvent::StepError {
            worker,
            step_index,
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Step, Workflow};

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute(&self, ctx: StepContext) -> Result<Value, String> {
            Ok(serde_json::json!({ "echo": ctx.step_id }))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _ctx: StepContext) -> Result<Value, String> {
            Err("boom".to_string())
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute(&self, _ctx: StepContext) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    fn workflow_with_steps(steps: Vec<Step>) -> Arc<RwLock<Workflow>> {
        Arc::new(RwLock::new(Workflow::new("test", steps).unwrap()))
    }

    fn dispatcher(
        executor: Arc<dyn TaskExecutor>,
    ) -> (Dispatcher, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("w1", ["compute"], 4);
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(registry, executor, tx), rx)
    }

    #[tokio::test]
    async fn test_dispatch_success_records_result_and_events() {
        let wf = workflow_with_steps(vec![Step::new("a", "A", "compute")]);
        let (dispatcher, mut rx) = dispatcher(Arc::new(EchoExecutor));

        let value = dispatcher.dispatch(&wf, 0, None).await.unwrap();
        assert_eq!(value["echo"], "a");

        let guard = wf.read().await;
        assert_eq!(guard.steps[0].state, StepState::Completed);
        assert!(guard.results.contains_key("a"));
        assert_eq!(guard.steps[0].attempts, 0);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::StepStarted { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::StepCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_step_and_logs_error() {
        let wf = workflow_with_steps(vec![Step::new("a", "A", "compute")]);
        let (dispatcher, mut rx) = dispatcher(Arc::new(FailingExecutor));

        let err = dispatcher.dispatch(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::Execution(_)));

        let guard = wf.read().await;
        assert_eq!(guard.steps[0].state, StepState::Failed);
        assert_eq!(guard.steps[0].attempts, 1);
        assert_eq!(guard.errors.len(), 1);

        // StepStarted then StepError
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::StepStarted { .. }
        ));
        match rx.try_recv().unwrap() {
            ExecutionEvent::StepError { kind, worker, .. } => {
                assert_eq!(kind, "execution");
                assert_eq!(worker.as_deref(), Some("w1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_no_suitable_worker() {
        let wf = workflow_with_steps(vec![Step::new("a", "A", "gpu")]);
        let (dispatcher, mut rx) = dispatcher(Arc::new(EchoExecutor));

        let err = dispatcher.dispatch(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::NoSuitableWorker { .. }));

        // No StepStarted without a lease
        match rx.try_recv().unwrap() {
            ExecutionEvent::StepError { worker, kind, .. } => {
                assert!(worker.is_none());
                assert_eq!(kind, "no_suitable_worker");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout() {
        let step = Step::new("a", "A", "compute").with_timeout(Duration::from_millis(50));
        let wf = workflow_with_steps(vec![step]);
        let (dispatcher, _rx) = dispatcher(Arc::new(SlowExecutor));

        let err = dispatcher.dispatch(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
        assert_eq!(wf.read().await.steps[0].state, StepState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_retry_budget_marks_failed() {
        // A retryable attempt must rest in Failed so it can re-enter
        // Running; TimedOut would end the step early.
        let step = Step::new("a", "A", "compute")
            .with_timeout(Duration::from_millis(50))
            .with_retries(2, 10);
        let wf = workflow_with_steps(vec![step]);
        let (dispatcher, _rx) = dispatcher(Arc::new(SlowExecutor));

        let err = dispatcher.dispatch(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));
        assert_eq!(wf.read().await.steps[0].state, StepState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_exhausted_retries_marks_timed_out() {
        let step = Step::new("a", "A", "compute")
            .with_timeout(Duration::from_millis(50))
            .with_retries(1, 10);
        let wf = workflow_with_steps(vec![step]);
        let (dispatcher, _rx) = dispatcher(Arc::new(SlowExecutor));

        let err = dispatcher.run_step(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::Timeout(_)));

        let guard = wf.read().await;
        assert_eq!(guard.steps[0].attempts, 2);
        assert_eq!(guard.steps[0].state, StepState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_step_retries_until_exhausted() {
        let step = Step::new("a", "A", "compute").with_retries(2, 10);
        let wf = workflow_with_steps(vec![step]);
        let (dispatcher, _rx) = dispatcher(Arc::new(FailingExecutor));

        let err = dispatcher.run_step(&wf, 0, None).await.unwrap_err();
        assert!(matches!(err, StepError::Execution(_)));

        // initial attempt + 2 retries
        assert_eq!(wf.read().await.steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_lease_released_after_failure() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("w1", ["compute"], 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::new(FailingExecutor), tx);

        let wf = workflow_with_steps(vec![Step::new("a", "A", "compute")]);
        let _ = dispatcher.dispatch(&wf, 0, None).await;

        // The single slot must be free again
        assert_eq!(registry.total_load(), 0);
    }

    #[tokio::test]
    async fn test_transforms_applied_and_published() {
        use crate::execution::transform::{AggregateOp, Transform};

        struct ArrayExecutor;
        #[async_trait]
        impl TaskExecutor for ArrayExecutor {
            async fn execute(&self, _ctx: StepContext) -> Result<Value, String> {
                Ok(serde_json::json!([{"v": 2.0}, {"v": 4.0}]))
            }
        }

        let step = Step::new("a", "A", "compute")
            .with_transform(Transform::Aggregate {
                field: Some("v".to_string()),
                op: AggregateOp::Sum,
            })
            .publish_as("total");
        let wf = workflow_with_steps(vec![step]);
        let (dispatcher, _rx) = dispatcher(Arc::new(ArrayExecutor));

        let value = dispatcher.dispatch(&wf, 0, None).await.unwrap();
        assert_eq!(value, serde_json::json!(6.0));

        let guard = wf.read().await;
        assert_eq!(guard.shared_data["total"], serde_json::json!(6.0));
        assert_eq!(guard.results["a"], serde_json::json!(6.0));
    }

    #[tokio::test]
    async fn test_pipeline_data_reaches_executor() {
        struct CaptureExecutor;
        #[async_trait]
        impl TaskExecutor for CaptureExecutor {
            async fn execute(&self, ctx: StepContext) -> Result<Value, String> {
                Ok(ctx.input.get("carried").cloned().unwrap_or(Value::Null))
            }
        }

        let wf = workflow_with_steps(vec![Step::new("a", "A", "compute")]);
        let (dispatcher, _rx) = dispatcher(Arc::new(CaptureExecutor));

        let mut data = HashMap::new();
        data.insert("carried".to_string(), serde_json::json!("forward"));
        let value = dispatcher.dispatch(&wf, 0, Some(&data)).await.unwrap();
        assert_eq!(value, serde_json::json!("forward"));
    }
}
