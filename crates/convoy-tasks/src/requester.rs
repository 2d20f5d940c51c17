//! Requester side of the broker.
//!
//! The execution engine talks to a [`TaskRequester`]; whether the broker runs
//! in the same process ([`LocalTaskRequester`]) or behind a transport is
//! invisible to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::broker::{RequesterToken, TaskBroker};
use crate::error::Result;
use crate::protocol::{BrokerToRequester, RequesterCallback, RequesterMessage, TaskResult};

/// Abort reason when the broker goes away before answering.
pub const ABORT_BROKER_SHUT_DOWN: &str = "broker shut down";

/// A submitted task whose result has not been collected yet.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    result: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the task's terminal result.
    pub async fn result(self) -> TaskResult {
        self.result
            .await
            .unwrap_or_else(|_| TaskResult::aborted(ABORT_BROKER_SHUT_DOWN))
    }
}

/// What the execution engine needs from a broker connection.
#[async_trait]
pub trait TaskRequester: Send + Sync {
    /// Submit `data` for a runner of `task_type`.
    ///
    /// `timeout` of `None` uses the broker default; `Duration::ZERO` means no
    /// deadline.
    async fn submit_task(
        &self,
        task_type: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle>;

    /// Ask the broker to cancel a task. The handle still resolves, with
    /// whichever result the broker settles on.
    async fn cancel_task(&self, task_id: &str) -> Result<()>;
}

type WaiterMap = Mutex<HashMap<String, oneshot::Sender<TaskResult>>>;
type Waiters = Arc<WaiterMap>;

/// Requester backed by a broker in the same process.
pub struct LocalTaskRequester {
    id: String,
    token: RequesterToken,
    broker: TaskBroker,
    waiters: Waiters,
}

impl LocalTaskRequester {
    /// Register a requester with a generated id.
    pub fn new(broker: TaskBroker) -> Self {
        Self::with_id(broker, format!("requester-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Register under a fixed id. Re-using an id replaces the earlier
    /// registration; dropping the replaced requester leaves the new one in
    /// place.
    pub fn with_id(broker: TaskBroker, id: impl Into<String>) -> Self {
        let id = id.into();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let token =
            broker.register_requester(id.clone(), Self::callback(&id, Arc::downgrade(&waiters)));
        Self {
            id,
            token,
            broker,
            waiters,
        }
    }

    fn callback(id: &str, waiters: Weak<WaiterMap>) -> RequesterCallback {
        let requester_id = id.to_string();
        Arc::new(move |message: BrokerToRequester| match message {
            // May trail the task's Result; nothing to settle either way.
            BrokerToRequester::Accepted { task_id } => {
                trace!(requester_id = %requester_id, task_id = %task_id, "task accepted by runner");
            }
            BrokerToRequester::Result { task_id, result } => {
                let Some(waiters) = waiters.upgrade() else {
                    return;
                };
                let Some(waiter) = waiters.lock().remove(&task_id) else {
                    warn!(requester_id = %requester_id, task_id = %task_id, "result for unknown task");
                    return;
                };
                // The caller may have dropped its handle.
                let _ = waiter.send(result);
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token of this requester's broker registration.
    pub fn token(&self) -> RequesterToken {
        self.token
    }

    /// Tasks submitted and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Abort every outstanding task of this requester.
    pub fn abort_all(&self, reason: &str) -> Result<()> {
        self.broker.on_requester_message(
            &self.id,
            RequesterMessage::AbortAll {
                reason: reason.to_string(),
            },
        )
    }
}

#[async_trait]
impl TaskRequester for LocalTaskRequester {
    async fn submit_task(
        &self,
        task_type: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        // Registered before submitting: the result can arrive before we return.
        self.waiters.lock().insert(task_id.clone(), tx);

        let message = RequesterMessage::Submit {
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            data,
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };
        if let Err(e) = self.broker.on_requester_message(&self.id, message) {
            self.waiters.lock().remove(&task_id);
            return Err(e);
        }

        debug!(requester_id = %self.id, task_id = %task_id, task_type, "task submitted");
        Ok(TaskHandle {
            task_id,
            result: rx,
        })
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.broker.on_requester_message(
            &self.id,
            RequesterMessage::Cancel {
                task_id: task_id.to_string(),
            },
        )
    }
}

impl Drop for LocalTaskRequester {
    fn drop(&mut self) {
        // Settles every open handle before the waiters go away.
        self.broker.deregister_requester(&self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::protocol::{
        ABORT_NO_RUNNER, ABORT_REQUESTER_DISCONNECTED, BrokerToRunner, RunnerInfo, RunnerMessage,
    };
    use serde_json::json;

    #[tokio::test]
    async fn test_results_routed_by_task_id() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::new(broker.clone());
        let assigned = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&assigned);
        broker.register_runner(
            RunnerInfo::new("r1", "js", ["javascript"]),
            Arc::new(move |msg: BrokerToRunner| {
                if let BrokerToRunner::Assign { task_id, .. } = msg {
                    sink.lock().push(task_id);
                }
            }),
        );

        let first = requester
            .submit_task("javascript", json!({"n": 1}), Some(Duration::ZERO))
            .await
            .unwrap();
        let second = requester
            .submit_task("javascript", json!({"n": 2}), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(requester.in_flight(), 2);

        for offer_id in ["o1", "o2"] {
            broker
                .on_runner_message(
                    "r1",
                    RunnerMessage::Offer {
                        offer_id: offer_id.into(),
                        task_type: "javascript".into(),
                        valid_for_ms: 0,
                    },
                )
                .unwrap();
        }
        let ids = assigned.lock().clone();
        assert_eq!(ids, vec![first.task_id().to_string(), second.task_id().to_string()]);

        // Finish them in reverse order
        for (id, value) in ids.iter().rev().zip([json!("second"), json!("first")]) {
            broker
                .on_runner_message("r1", RunnerMessage::Accepted { task_id: id.clone() })
                .unwrap();
            broker
                .on_runner_message(
                    "r1",
                    RunnerMessage::Done {
                        task_id: id.clone(),
                        data: value,
                    },
                )
                .unwrap();
        }

        assert_eq!(first.result().await, TaskResult::success(json!("first")));
        assert_eq!(second.result().await, TaskResult::success(json!("second")));
        assert_eq!(requester.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_runner() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::with_id(broker, "engine");
        let handle = requester
            .submit_task("javascript", json!({}), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(handle.result().await, TaskResult::aborted(ABORT_NO_RUNNER));
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::new(broker);
        let handle = requester
            .submit_task("javascript", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();
        requester.cancel_task(handle.task_id()).await.unwrap();
        assert!(handle.result().await.is_aborted());
    }

    #[tokio::test]
    async fn test_dropped_requester_resolves_handle() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::with_id(broker.clone(), "engine");
        let handle = requester
            .submit_task("javascript", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();

        drop(requester);
        assert_eq!(broker.stats().requesters, 0);
        assert_eq!(broker.stats().pending, 0);
        assert_eq!(
            handle.result().await,
            TaskResult::aborted(ABORT_REQUESTER_DISCONNECTED)
        );
    }

    #[tokio::test]
    async fn test_deregistration_settles_open_handles() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::with_id(broker.clone(), "engine");
        let handle = requester
            .submit_task("javascript", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();

        assert!(broker.deregister_requester("engine", requester.token()));
        assert_eq!(requester.in_flight(), 0);
        let result = tokio::time::timeout(Duration::from_millis(500), handle.result())
            .await
            .unwrap();
        assert_eq!(result, TaskResult::aborted(ABORT_REQUESTER_DISCONNECTED));
    }

    #[tokio::test]
    async fn test_replaced_requester_drop_keeps_new_registration() {
        let broker = TaskBroker::default();
        let old = LocalTaskRequester::with_id(broker.clone(), "engine");
        let new = LocalTaskRequester::with_id(broker.clone(), "engine");

        drop(old);
        assert_eq!(broker.stats().requesters, 1);

        let handle = new
            .submit_task("javascript", json!({}), Some(Duration::ZERO))
            .await
            .unwrap();
        new.cancel_task(handle.task_id()).await.unwrap();
        assert!(handle.result().await.is_aborted());

        drop(new);
        assert_eq!(broker.stats().requesters, 0);
    }

    #[tokio::test]
    async fn test_accepted_after_result_is_ignored() {
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        waiters.lock().insert("t1".to_string(), tx);
        let callback = LocalTaskRequester::callback("engine", Arc::downgrade(&waiters));

        callback(BrokerToRequester::Result {
            task_id: "t1".into(),
            result: TaskResult::success(json!(1)),
        });
        callback(BrokerToRequester::Accepted {
            task_id: "t1".into(),
        });

        assert!(waiters.lock().is_empty());
        assert_eq!(rx.await.unwrap(), TaskResult::success(json!(1)));
    }

    #[tokio::test]
    async fn test_submit_after_deregistration_fails() {
        let broker = TaskBroker::default();
        let requester = LocalTaskRequester::with_id(broker.clone(), "engine");
        broker.deregister_requester("engine", requester.token());
        let err = requester
            .submit_task("javascript", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotRegistered(_)));
        assert_eq!(requester.in_flight(), 0);
    }
}
