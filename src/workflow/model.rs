//! Workflow Data Model
//!
//! Core data structures representing workflow steps, their dependencies,
//! and the pure DAG queries used by the scheduler.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: nightly-report
//! strategy: parallel
//! max_parallel_steps: 4
//! steps:
//!   - name: Fetch Records
//!     capability: crm.query
//!     estimated_duration_ms: 2000
//!
//!   - name: Summarize
//!     capability: llm.summarize
//!     dependencies:
//!       - fetch-records
//!     publish_as: summary
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::execution::transform::Transform;

/// Execution state of a single step.
///
/// `Failed` may re-enter `Running` while retry attempts remain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Step is waiting for dependencies
    Pending,
    /// Step is currently executing
    Running,
    /// Step completed successfully
    Completed,
    /// Step failed (terminal once retries are exhausted)
    Failed,
    /// Step was cancelled before execution
    Cancelled,
    /// Step exceeded its timeout
    TimedOut,
}

impl StepState {
    /// Returns true for states a step never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// Execution state of a whole workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// How a workflow's steps are scheduled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Declaration order, one step at a time
    Sequential,
    /// Dependency-layered groups executed concurrently
    Parallel,
    /// Continuous ready-set scheduling with in-run rebalancing
    Adaptive,
    /// Declaration order, threading a shared data map forward
    Pipeline,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Semantic kind of a dependency edge.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Sequential,
    Data,
    Conditional,
    Resource,
}

impl Default for DependencyKind {
    fn default() -> Self {
        Self::Sequential
    }
}

/// A dependency on another step in the same workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// ID of the step that must complete first
    pub step_id: String,
    /// Kind of the edge (defaults to sequential)
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(step_id: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
        }
    }
}

/// Resource hints attached to a step.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResourceRequirements {
    /// CPU cores requested (advisory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    /// Memory requested in megabytes (advisory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Exclusive steps never co-run with another exclusive step
    #[serde(default)]
    pub exclusive: bool,
}

/// Deserializes dependencies given either as bare step ids or as maps
/// with an explicit kind.
fn ids_or_dependencies<'de, D>(deserializer: D) -> Result<Vec<Dependency>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(Dependency::new(s, DependencyKind::Sequential)),
                other => serde_json::from_value(other)
                    .map_err(|e| de::Error::custom(format!("invalid dependency: {}", e))),
            })
            .collect(),
        Value::String(s) => Ok(vec![Dependency::new(s, DependencyKind::Sequential)]),
        _ => Err(de::Error::custom("expected dependency list")),
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_estimated_duration_ms() -> u64 {
    1000
}

fn default_max_parallel() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Caller-facing specification of one step.
///
/// Everything except `name` and `capability` has a default, so YAML specs
/// stay short. The id defaults to a slug of the name.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepSpec {
    /// Unique identifier (derived from the name when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable step name
    pub name: String,

    /// What this step does
    #[serde(default)]
    pub description: String,

    /// Capability a worker must offer to run this step
    pub capability: String,

    /// Additional capabilities the worker must also offer
    #[serde(default)]
    pub extra_capabilities: Vec<String>,

    /// Steps that must complete before this one
    #[serde(default, deserialize_with = "ids_or_dependencies")]
    pub dependencies: Vec<Dependency>,

    /// Per-attempt execution timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of retry attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,

    /// Base retry delay in milliseconds (delay = base x attempt)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Estimated duration used for scheduling and the critical path
    #[serde(default = "default_estimated_duration_ms")]
    pub estimated_duration_ms: u64,

    /// Scheduling priority boost (higher runs earlier)
    #[serde(default)]
    pub priority_boost: i64,

    /// Resource hints, including the exclusivity flag
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Transformations applied to the raw executor result
    #[serde(default)]
    pub transforms: Vec<Transform>,

    /// Shared-data key the transformed result is published under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_as: Option<String>,
}

/// Caller-facing specification of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<StepSpec>,

    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub strategy: ExecutionStrategy,

    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,

    /// Overall workflow timeout in seconds (unbounded when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// When false, exhausted step retries abort the whole run
    #[serde(default = "default_true")]
    pub auto_retry: bool,

    /// Initial input context passed to every step
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// Turns a display name into a step id slug.
fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(char::is_whitespace, "-")
}

/// A single unit of work inside a workflow.
///
/// Carries both the immutable declaration (capability, dependencies,
/// retry policy) and the mutable execution record (state, timestamps,
/// result). The `assigned_worker` field is the scheduler's *current*
/// routing target and is distinct from the declared `capability`, so
/// rerouting never loses original intent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// What this step does
    #[serde(default)]
    pub description: String,

    /// Capability a worker must offer to run this step
    pub capability: String,

    /// Additional required capabilities
    #[serde(default)]
    pub extra_capabilities: Vec<String>,

    /// Steps that must complete before this one
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Per-attempt execution timeout
    pub timeout: Duration,

    /// Retry attempts allowed after the first failure
    pub retry_count: u32,

    /// Base retry delay (delay = base x attempt number)
    pub retry_base_delay: Duration,

    /// Estimated duration in milliseconds
    pub estimated_duration_ms: u64,

    /// Scheduling priority boost
    pub priority_boost: i64,

    /// Resource hints
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Result transformations
    #[serde(default)]
    pub transforms: Vec<Transform>,

    /// Shared-data key for the transformed result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_as: Option<String>,

    /// Current routing target set by adaptive rerouting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,

    /// Current execution state
    pub state: StepState,

    /// When the most recent attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Observed execution time of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,

    /// Failures recorded so far (increments once per failed attempt)
    #[serde(default)]
    pub attempts: u32,

    /// Result payload of the last successful attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form numeric metrics
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

impl Step {
    /// Creates a new pending step.
    ///
    /// # Example
    ///
    /// ```
    /// use taskdeck::workflow::Step;
    ///
    /// let step = Step::new("align", "Align records", "crm.query")
    ///     .depends_on("fetch")
    ///     .with_estimated_duration_ms(500)
    ///     .with_retries(2, 100);
    /// ```
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            description: String::new(),
            capability: capability.into().trim().to_string(),
            extra_capabilities: Vec::new(),
            dependencies: Vec::new(),
            timeout: Duration::from_secs(default_timeout_secs()),
            retry_count: 0,
            retry_base_delay: Duration::from_millis(default_retry_base_delay_ms()),
            estimated_duration_ms: default_estimated_duration_ms(),
            priority_boost: 0,
            resources: ResourceRequirements::default(),
            transforms: Vec::new(),
            publish_as: None,
            assigned_worker: None,
            state: StepState::Pending,
            started_at: None,
            finished_at: None,
            execution_time_ms: None,
            attempts: 0,
            result: None,
            error: None,
            metrics: HashMap::new(),
        }
    }

    /// Builds a runtime step from a caller specification.
    pub fn from_spec(spec: StepSpec) -> Self {
        let id = spec
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| slugify(&spec.name));

        let mut step = Step::new(id, spec.name, spec.capability);
        step.description = spec.description;
        step.extra_capabilities = spec.extra_capabilities;
        step.dependencies = spec.dependencies;
        step.timeout = Duration::from_secs(spec.timeout_secs);
        step.retry_count = spec.retry_count;
        step.retry_base_delay = Duration::from_millis(spec.retry_base_delay_ms);
        step.estimated_duration_ms = spec.estimated_duration_ms;
        step.priority_boost = spec.priority_boost;
        step.resources = spec.resources;
        step.transforms = spec.transforms;
        step.publish_as = spec.publish_as;
        step
    }

    /// Adds a sequential dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies
            .push(Dependency::new(step_id, DependencyKind::Sequential));
        self
    }

    /// Adds a dependency with an explicit kind.
    pub fn with_dependency(mut self, step_id: impl Into<String>, kind: DependencyKind) -> Self {
        self.dependencies.push(Dependency::new(step_id, kind));
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy: extra attempts and base delay in milliseconds.
    pub fn with_retries(mut self, count: u32, base_delay_ms: u64) -> Self {
        self.retry_count = count;
        self.retry_base_delay = Duration::from_millis(base_delay_ms);
        self
    }

    /// Sets the duration estimate used for scheduling.
    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    /// Sets the scheduling priority boost.
    pub fn with_priority_boost(mut self, boost: i64) -> Self {
        self.priority_boost = boost;
        self
    }

    /// Marks this step as exclusive (never co-runs with another exclusive step).
    pub fn exclusive(mut self) -> Self {
        self.resources.exclusive = true;
        self
    }

    /// Appends a result transformation.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Publishes the transformed result under a shared-data key.
    pub fn publish_as(mut self, key: impl Into<String>) -> Self {
        self.publish_as = Some(key.into());
        self
    }

    /// Iterates over the ids of this step's dependencies.
    pub fn dependency_ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.step_id.as_str())
    }

    /// True iff every dependency id is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.dependency_ids().all(|dep| completed.contains(dep))
    }

    /// True unless either step depends on the other, or both are exclusive.
    pub fn can_run_in_parallel(&self, other: &Step) -> bool {
        if self.dependency_ids().any(|d| d == other.id)
            || other.dependency_ids().any(|d| d == self.id)
        {
            return false;
        }
        !(self.resources.exclusive && other.resources.exclusive)
    }
}

/// A DAG of steps plus an execution policy.
///
/// Created once from a validated spec, mutated only by the execution
/// engine during a run, and read-only after reaching a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,

    /// Steps in declaration order (not execution order)
    pub steps: Vec<Step>,

    #[serde(default)]
    pub priority: i64,
    pub strategy: ExecutionStrategy,
    pub max_parallel_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub auto_retry: bool,

    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Step currently being dispatched (last one under concurrent strategies)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Step id -> result payload
    #[serde(default)]
    pub results: HashMap<String, Value>,

    /// Intermediate data shared across steps
    #[serde(default)]
    pub shared_data: HashMap<String, Value>,

    /// Accumulated error log
    #[serde(default)]
    pub errors: Vec<String>,

    /// Input context passed to every step
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl Workflow {
    /// Builds and validates a workflow from already-constructed steps.
    ///
    /// This is the programmatic counterpart to [`Workflow::from_spec`],
    /// pairing with the [`Step`] builder methods.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, super::validator::ValidationError> {
        let workflow = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            steps,
            priority: 0,
            strategy: ExecutionStrategy::default(),
            max_parallel_steps: default_max_parallel(),
            timeout: None,
            auto_retry: true,
            state: WorkflowState::Pending,
            started_at: None,
            finished_at: None,
            current_step: None,
            results: HashMap::new(),
            shared_data: HashMap::new(),
            errors: Vec::new(),
            context: HashMap::new(),
        };

        super::validator::validate_workflow(&workflow)?;
        Ok(workflow)
    }

    /// Sets the execution strategy.
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Caps the number of concurrently running steps.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_steps = max.max(1);
        self
    }

    /// Disables continue-on-failure: exhausted step retries abort the run.
    pub fn without_auto_retry(mut self) -> Self {
        self.auto_retry = false;
        self
    }

    /// Builds and validates a workflow from a caller specification.
    ///
    /// Validation is synchronous and fatal: empty workflows, duplicate or
    /// empty ids, unknown dependency references, and dependency cycles are
    /// all rejected here rather than at run time.
    pub fn from_spec(spec: WorkflowSpec) -> Result<Self, super::validator::ValidationError> {
        let workflow = Self {
            id: Uuid::new_v4(),
            name: spec.name.trim().to_string(),
            description: spec.description,
            steps: spec.steps.into_iter().map(Step::from_spec).collect(),
            priority: spec.priority,
            strategy: spec.strategy,
            max_parallel_steps: spec.max_parallel_steps.max(1),
            timeout: spec.timeout_secs.map(Duration::from_secs),
            auto_retry: spec.auto_retry,
            state: WorkflowState::Pending,
            started_at: None,
            finished_at: None,
            current_step: None,
            results: HashMap::new(),
            shared_data: HashMap::new(),
            errors: Vec::new(),
            context: spec.context,
        };

        super::validator::validate_workflow(&workflow)?;
        Ok(workflow)
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// IDs of all completed steps.
    pub fn completed_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Pending steps whose dependencies are all completed, sorted by
    /// descending priority boost and ascending estimated duration.
    pub fn ready_steps(&self) -> Vec<&Step> {
        let completed = self.completed_ids();
        let mut ready: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Pending && s.is_ready(&completed))
            .collect();

        ready.sort_by_key(|s| (std::cmp::Reverse(s.priority_boost), s.estimated_duration_ms));
        ready
    }

    /// Fraction of steps completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .count();
        completed as f64 / self.steps.len() as f64
    }

    /// Completed steps over total steps.
    pub fn success_rate(&self) -> f64 {
        self.progress()
    }

    /// True once every step is in a terminal state.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_step(name: &str, capability: &str) -> StepSpec {
        StepSpec {
            id: None,
            name: name.to_string(),
            description: String::new(),
            capability: capability.to_string(),
            extra_capabilities: Vec::new(),
            dependencies: Vec::new(),
            timeout_secs: default_timeout_secs(),
            retry_count: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            estimated_duration_ms: default_estimated_duration_ms(),
            priority_boost: 0,
            resources: ResourceRequirements::default(),
            transforms: Vec::new(),
            publish_as: None,
        }
    }

    fn two_step_workflow() -> Workflow {
        let mut second = spec_step("Second", "cap");
        second.dependencies = vec![Dependency::new("first", DependencyKind::Data)];
        Workflow::from_spec(WorkflowSpec {
            name: "test".to_string(),
            description: String::new(),
            steps: vec![spec_step("First", "cap"), second],
            priority: 0,
            strategy: ExecutionStrategy::Sequential,
            max_parallel_steps: 4,
            timeout_secs: None,
            auto_retry: true,
            context: HashMap::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new("align", "Align", "crm.query")
            .depends_on("fetch")
            .with_estimated_duration_ms(500)
            .with_retries(2, 100)
            .with_priority_boost(3);

        assert_eq!(step.id, "align");
        assert_eq!(step.capability, "crm.query");
        assert_eq!(step.dependencies.len(), 1);
        assert_eq!(step.estimated_duration_ms, 500);
        assert_eq!(step.retry_count, 2);
        assert_eq!(step.retry_base_delay, Duration::from_millis(100));
        assert_eq!(step.priority_boost, 3);
        assert_eq!(step.state, StepState::Pending);
    }

    #[test]
    fn test_step_id_from_name_slug() {
        let step = Step::from_spec(spec_step("Fetch Records", "crm.query"));
        assert_eq!(step.id, "fetch-records");
    }

    #[test]
    fn test_step_explicit_id_wins() {
        let mut spec = spec_step("Fetch Records", "crm.query");
        spec.id = Some("fetch".to_string());
        assert_eq!(Step::from_spec(spec).id, "fetch");
    }

    #[test]
    fn test_is_ready() {
        let step = Step::new("b", "B", "cap").depends_on("a");

        let mut completed = HashSet::new();
        assert!(!step.is_ready(&completed));

        completed.insert("a".to_string());
        assert!(step.is_ready(&completed));
    }

    #[test]
    fn test_is_ready_no_dependencies() {
        let step = Step::new("a", "A", "cap");
        assert!(step.is_ready(&HashSet::new()));
    }

    #[test]
    fn test_can_run_in_parallel_independent() {
        let a = Step::new("a", "A", "cap");
        let b = Step::new("b", "B", "cap");
        assert!(a.can_run_in_parallel(&b));
        assert!(b.can_run_in_parallel(&a));
    }

    #[test]
    fn test_cannot_run_in_parallel_with_dependency() {
        let a = Step::new("a", "A", "cap");
        let b = Step::new("b", "B", "cap").depends_on("a");
        assert!(!a.can_run_in_parallel(&b));
        assert!(!b.can_run_in_parallel(&a));
    }

    #[test]
    fn test_cannot_run_in_parallel_both_exclusive() {
        let a = Step::new("a", "A", "cap").exclusive();
        let b = Step::new("b", "B", "cap").exclusive();
        assert!(!a.can_run_in_parallel(&b));
    }

    #[test]
    fn test_one_exclusive_is_fine() {
        let a = Step::new("a", "A", "cap").exclusive();
        let b = Step::new("b", "B", "cap");
        assert!(a.can_run_in_parallel(&b));
    }

    #[test]
    fn test_ready_steps_ordering() {
        let mut workflow = two_step_workflow();
        // Add two more independent steps with different priorities/durations
        workflow.steps.push(
            Step::new("boosted", "Boosted", "cap")
                .with_priority_boost(5)
                .with_estimated_duration_ms(900),
        );
        workflow
            .steps
            .push(Step::new("quick", "Quick", "cap").with_estimated_duration_ms(10));

        let ready: Vec<&str> = workflow.ready_steps().iter().map(|s| s.id.as_str()).collect();
        // boosted first (priority), then quick (shorter), then first
        assert_eq!(ready, vec!["boosted", "quick", "first"]);
    }

    #[test]
    fn test_ready_steps_skips_blocked() {
        let workflow = two_step_workflow();
        let ready: Vec<&str> = workflow.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["first"]);
    }

    #[test]
    fn test_progress_bounds() {
        let mut workflow = two_step_workflow();
        assert_eq!(workflow.progress(), 0.0);

        workflow.get_step_mut("first").unwrap().state = StepState::Completed;
        assert_eq!(workflow.progress(), 0.5);

        workflow.get_step_mut("second").unwrap().state = StepState::Completed;
        assert_eq!(workflow.progress(), 1.0);
    }

    #[test]
    fn test_from_spec_rejects_unknown_dependency() {
        let mut bad = spec_step("Bad", "cap");
        bad.dependencies = vec![Dependency::new("ghost", DependencyKind::Sequential)];
        let result = Workflow::from_spec(WorkflowSpec {
            name: "wf".to_string(),
            description: String::new(),
            steps: vec![bad],
            priority: 0,
            strategy: ExecutionStrategy::Sequential,
            max_parallel_steps: 4,
            timeout_secs: None,
            auto_retry: true,
            context: HashMap::new(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_from_spec_rejects_empty() {
        let result = Workflow::from_spec(WorkflowSpec {
            name: "wf".to_string(),
            description: String::new(),
            steps: vec![],
            priority: 0,
            strategy: ExecutionStrategy::Sequential,
            max_parallel_steps: 4,
            timeout_secs: None,
            auto_retry: true,
            context: HashMap::new(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_dependency_deserialize_bare_ids() {
        let yaml = r#"
name: Second
capability: cap
dependencies:
  - first
  - step_id: other
    kind: data
"#;
        let spec: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.dependencies.len(), 2);
        assert_eq!(spec.dependencies[0].step_id, "first");
        assert_eq!(spec.dependencies[0].kind, DependencyKind::Sequential);
        assert_eq!(spec.dependencies[1].step_id, "other");
        assert_eq!(spec.dependencies[1].kind, DependencyKind::Data);
    }

    #[test]
    fn test_step_spec_defaults() {
        let yaml = "name: Minimal\ncapability: cap";
        let spec: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.timeout_secs, 300);
        assert_eq!(spec.retry_count, 0);
        assert_eq!(spec.retry_base_delay_ms, 1000);
        assert_eq!(spec.estimated_duration_ms, 1000);
        assert!(!spec.resources.exclusive);
    }

    #[test]
    fn test_workflow_spec_defaults() {
        let yaml = "name: wf\nsteps:\n  - name: Only\n    capability: cap";
        let spec: WorkflowSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.strategy, ExecutionStrategy::Sequential);
        assert_eq!(spec.max_parallel_steps, 4);
        assert!(spec.auto_retry);
        assert!(spec.timeout_secs.is_none());
    }

    #[test]
    fn test_state_terminality() {
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(StepState::Completed.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Cancelled.is_terminal());
        assert!(StepState::TimedOut.is_terminal());
        assert!(!WorkflowState::Initializing.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
    }

    #[test]
    fn test_get_step_mut() {
        let mut workflow = two_step_workflow();
        workflow.get_step_mut("first").unwrap().priority_boost = 9;
        assert_eq!(workflow.get_step("first").unwrap().priority_boost, 9);
        assert!(workflow.get_step("nonexistent").is_none());
    }
}
