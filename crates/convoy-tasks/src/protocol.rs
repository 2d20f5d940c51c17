//! Messages exchanged between requesters, the broker, and runners.
//!
//! ```text
//!  requester                    broker                       runner
//!      │                          │ ◀──────── Offer ───────────── │
//!      │ ──── Submit ───────────▶ │ ──────── Assign ────────────▶ │
//!      │                          │ ◀──────── Accepted ────────── │
//!      │ ◀─── Accepted ────────── │ ──────── Settings ──────────▶ │
//!      │                          │ ◀──────── Done / Error ────── │
//!      │ ◀─── Result ──────────── │                               │
//! ```
//!
//! All messages serialize as internally tagged JSON objects so a remote
//! transport can carry them unchanged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Abort reason when no runner picked up a task before its deadline.
pub const ABORT_NO_RUNNER: &str = "no runner available";

/// Abort reason when the bound runner went away.
pub const ABORT_RUNNER_DISCONNECTED: &str = "runner disconnected";

/// Abort reason when the requester deregistered with tasks outstanding.
pub const ABORT_REQUESTER_DISCONNECTED: &str = "requester disconnected";

/// Abort reason when the requester cancelled.
pub const ABORT_CANCELLED: &str = "cancelled";

/// Abort reason when a bound task outlived its deadline.
pub const ABORT_TIMED_OUT: &str = "timed out";

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskResult {
    /// The script ran and produced output.
    Success { data: Value },
    /// The script ran and failed.
    Error { reason: String },
    /// The script never finished (timeout, disconnect, cancellation).
    Aborted { reason: String },
}

impl TaskResult {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Short outcome label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::Aborted { .. } => "aborted",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requester side
// ─────────────────────────────────────────────────────────────────────────────

/// Requester → broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RequesterMessage {
    /// Run `data` on a runner that handles `task_type`.
    ///
    /// `timeout_ms` of `None` uses the broker default; `Some(0)` means no
    /// deadline.
    Submit {
        task_id: String,
        task_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Cancel {
        task_id: String,
    },
    /// Abort every outstanding task of this requester.
    AbortAll {
        reason: String,
    },
}

/// Broker → requester.
///
/// Messages from concurrent broker calls may arrive in either order; only
/// `Result` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrokerToRequester {
    /// A runner accepted the task and is running it.
    Accepted { task_id: String },
    /// The task reached a terminal state. Sent exactly once per task.
    Result { task_id: String, result: TaskResult },
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner side
// ─────────────────────────────────────────────────────────────────────────────

/// What a runner announces when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    pub id: String,
    pub name: String,
    pub task_types: Vec<String>,
}

impl RunnerInfo {
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            task_types: task_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }
}

/// Runner → broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunnerMessage {
    /// Capacity for one task of `task_type`, valid for `valid_for_ms`
    /// (0 uses the broker default).
    Offer {
        offer_id: String,
        task_type: String,
        #[serde(default)]
        valid_for_ms: u64,
    },
    Accepted {
        task_id: String,
    },
    Rejected {
        task_id: String,
        reason: String,
    },
    Done {
        task_id: String,
        data: Value,
    },
    Error {
        task_id: String,
        error: String,
    },
    /// Acknowledges a broker `Cancel`.
    Cancelled {
        task_id: String,
    },
}

/// Broker → runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrokerToRunner {
    /// A task was matched to one of this runner's offers.
    Assign {
        task_id: String,
        offer_id: String,
        task_type: String,
    },
    /// Input for an accepted task.
    Settings {
        task_id: String,
        data: Value,
        /// Milliseconds left before the requester's deadline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline_ms: Option<u64>,
    },
    Cancel {
        task_id: String,
        reason: String,
    },
}

/// Delivery callback for a registered requester.
pub type RequesterCallback = Arc<dyn Fn(BrokerToRequester) + Send + Sync>;

/// Delivery callback for a registered runner.
pub type RunnerCallback = Arc<dyn Fn(BrokerToRunner) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requester_message_wire_format() {
        let msg = RequesterMessage::Submit {
            task_id: "t1".into(),
            task_type: "javascript".into(),
            data: json!({"code": "return 1"}),
            timeout_ms: Some(500),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "submit",
                "taskId": "t1",
                "taskType": "javascript",
                "data": {"code": "return 1"},
                "timeoutMs": 500,
            })
        );
    }

    #[test]
    fn test_result_wire_format() {
        let msg = BrokerToRequester::Result {
            task_id: "t1".into(),
            result: TaskResult::aborted(ABORT_RUNNER_DISCONNECTED),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "result",
                "taskId": "t1",
                "result": {"status": "aborted", "reason": "runner disconnected"},
            })
        );
    }

    #[test]
    fn test_offer_defaults_validity() {
        let msg: RunnerMessage =
            serde_json::from_value(json!({"type": "offer", "offerId": "o1", "taskType": "javascript"}))
                .unwrap();
        assert_eq!(
            msg,
            RunnerMessage::Offer {
                offer_id: "o1".into(),
                task_type: "javascript".into(),
                valid_for_ms: 0,
            }
        );
    }

    #[test]
    fn test_runner_supports() {
        let info = RunnerInfo::new("r1", "js runner", ["javascript"]);
        assert!(info.supports("javascript"));
        assert!(!info.supports("python"));
    }
}
