//! Error types for the task broker.

use thiserror::Error;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error type for broker operations.
///
/// These cover protocol misuse only. A task that fails, times out, or loses
/// its runner is reported through a [`TaskResult`](crate::TaskResult), never
/// as an error.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A message arrived from a requester id that never registered.
    #[error("requester not registered: {0}")]
    NotRegistered(String),

    /// A message arrived from a runner id that never registered.
    #[error("runner not registered: {0}")]
    RunnerNotRegistered(String),

    /// A runner offered a task type it did not advertise.
    #[error("runner {runner_id} does not support task type {task_type}")]
    UnsupportedTaskType { runner_id: String, task_type: String },

    /// A requester reused a task id that is still in flight.
    #[error("task already submitted: {0}")]
    DuplicateTask(String),
}

impl BrokerError {
    pub fn unsupported(runner_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::UnsupportedTaskType {
            runner_id: runner_id.into(),
            task_type: task_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            BrokerError::NotRegistered("req-1".into()).to_string(),
            "requester not registered: req-1"
        );
        assert_eq!(
            BrokerError::unsupported("runner-1", "python").to_string(),
            "runner runner-1 does not support task type python"
        );
    }
}
