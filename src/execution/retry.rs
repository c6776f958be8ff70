//! Retry policy
//!
//! Step-level retry with linear backoff: delay = base delay × attempt
//! number. Stateless — the attempt counter lives on the step itself, so
//! the policy stays trivially shareable across concurrent dispatches.

use std::time::Duration;

use log::debug;

use crate::workflow::Step;

/// Decides whether a failed step gets another attempt, and how long to
/// wait before it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn new() -> Self {
        Self
    }

    /// True while the step has retry attempts remaining. `attempts` is
    /// the number of failures recorded so far.
    pub fn should_retry(&self, step: &Step, attempts: u32) -> bool {
        let retry = attempts <= step.retry_count;
        if !retry && step.retry_count > 0 {
            debug!(
                "step '{}' exhausted its {} retries",
                step.id, step.retry_count
            );
        }
        retry
    }

    /// Backoff before the next attempt: base delay scaled by the number
    /// of failures so far.
    pub fn backoff(&self, step: &Step, attempts: u32) -> Duration {
        step.retry_base_delay * attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with_retries(count: u32) -> Step {
        Step::new("s", "s", "compute").with_retries(count, 100)
    }

    #[test]
    fn test_no_retries_configured() {
        let policy = RetryPolicy::new();
        let step = step_with_retries(0);
        assert!(!policy.should_retry(&step, 1));
    }

    #[test]
    fn test_retries_until_exhausted() {
        let policy = RetryPolicy::new();
        let step = step_with_retries(2);

        // 1st and 2nd failure still get a retry, 3rd does not
        assert!(policy.should_retry(&step, 1));
        assert!(policy.should_retry(&step, 2));
        assert!(!policy.should_retry(&step, 3));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new();
        let step = step_with_retries(3);

        assert_eq!(policy.backoff(&step, 1), Duration::from_millis(100));
        assert_eq!(policy.backoff(&step, 2), Duration::from_millis(200));
        assert_eq!(policy.backoff(&step, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_floor_at_one_attempt() {
        let policy = RetryPolicy::new();
        let step = step_with_retries(1);
        assert_eq!(policy.backoff(&step, 0), Duration::from_millis(100));
    }
}
