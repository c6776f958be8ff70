//! Execution events
//!
//! Ordered event stream emitted per run. Every run starts with exactly
//! one `WorkflowStarted`, interleaves step events (interleaving is
//! expected under concurrent strategies), and ends with exactly one
//! `WorkflowCompleted` — even when the run failed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::WorkflowState;

/// Final per-run summary attached to the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: WorkflowState,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub success_rate: f64,
    pub total_execution_time_ms: u64,
}

/// One entry in a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        name: String,
    },
    StepStarted {
        worker: String,
        step_index: usize,
        step_id: String,
    },
    StepCompleted {
        worker: String,
        step_index: usize,
        output: Value,
    },
    StepError {
        /// `None` when the failure happened before a worker was leased.
        worker: Option<String>,
        step_index: usize,
        kind: String,
        message: String,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        session_id: Option<String>,
        summary: RunSummary,
    },
}

impl ExecutionEvent {
    /// True for the terminal event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::WorkflowCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_flag() {
        let started = ExecutionEvent::WorkflowStarted {
            workflow_id: Uuid::new_v4(),
            name: "w".to_string(),
        };
        assert!(!started.is_terminal());

        let done = ExecutionEvent::WorkflowCompleted {
            workflow_id: Uuid::new_v4(),
            session_id: None,
            summary: RunSummary {
                state: WorkflowState::Completed,
                completed_steps: 1,
                total_steps: 1,
                success_rate: 1.0,
                total_execution_time_ms: 5,
            },
        };
        assert!(done.is_terminal());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ExecutionEvent::StepError {
            worker: None,
            step_index: 2,
            kind: "timeout".to_string(),
            message: "step timed out".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_error");
        assert_eq!(json["step_index"], 2);
        assert!(json["worker"].is_null());
    }
}
