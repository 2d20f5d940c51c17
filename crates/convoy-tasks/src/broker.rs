//! In-process task broker.
//!
//! The broker pairs requesters (which need a script executed) with runners
//! (isolated processes that execute scripts). Runners advertise capacity with
//! short-lived offers; a submitted task is matched to the oldest valid offer
//! for its type, or waits in a per-type pending queue.
//!
//! Per-task state machine:
//!
//! ```text
//! pending ──▶ offered ──▶ running ──▶ success | error | aborted
//!    ▲           │
//!    └─rejected──┘
//! ```
//!
//! All state lives behind one lock. Matching runs inside that critical
//! section; callbacks to requesters and runners run after it is released, so
//! a callback may call straight back into the broker.
//!
//! Delivery order: messages produced by one broker call reach their callbacks
//! in the order they were produced, and a caller that sends runner messages
//! one after another sees the requester messages in that same order. Calls
//! made concurrently from different threads carry no relative order, so a
//! requester may see a task's `Result` before its `Accepted`. `Result` is the
//! only terminal message; requesters must ignore `Accepted` for a task they
//! already settled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, Result};
use crate::offers::{OfferPool, TaskOffer};
use crate::protocol::{
    ABORT_CANCELLED, ABORT_NO_RUNNER, ABORT_REQUESTER_DISCONNECTED, ABORT_RUNNER_DISCONNECTED,
    ABORT_TIMED_OUT, BrokerToRequester, BrokerToRunner, RequesterCallback, RequesterMessage, RunnerCallback,
    RunnerInfo, RunnerMessage, TaskResult,
};

/// Broker timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Validity of an offer that does not state its own.
    pub offer_validity: Duration,
    /// Deadline for a task submitted without one. Zero disables it.
    pub default_task_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            offer_validity: Duration::from_secs(5),
            default_task_timeout: Duration::from_secs(60),
        }
    }
}

/// Where a task is in its lifecycle. Terminal tasks are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Offered {
        runner_id: String,
        offer_id: String,
    },
    Running {
        runner_id: String,
        cancel_requested: bool,
    },
}

impl TaskState {
    /// The runner bound to the task, if any.
    pub fn runner_id(&self) -> Option<&str> {
        match self {
            TaskState::Pending => None,
            TaskState::Offered { runner_id, .. } | TaskState::Running { runner_id, .. } => {
                Some(runner_id)
            }
        }
    }
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub requesters: usize,
    pub runners: usize,
    pub offers: usize,
    pub pending: usize,
    pub offered: usize,
    pub running: usize,
}

struct TaskEntry {
    task_type: String,
    requester_id: String,
    data: Value,
    deadline: Option<Instant>,
    state: TaskState,
    timer: Option<JoinHandle<()>>,
}

/// Identifies one registration of a requester id.
///
/// Re-registering an id issues a new token, so a stale holder cannot remove
/// the registration that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterToken(u64);

struct RequesterEntry {
    token: RequesterToken,
    callback: RequesterCallback,
}

struct RunnerEntry {
    info: RunnerInfo,
    callback: RunnerCallback,
}

enum Outbound {
    Requester(RequesterCallback, BrokerToRequester),
    Runner(RunnerCallback, BrokerToRunner),
}

/// Messages collected under the lock and delivered after it is released.
#[derive(Default)]
struct Outbox(Vec<Outbound>);

impl Outbox {
    fn deliver(self) {
        for message in self.0 {
            match message {
                Outbound::Requester(callback, msg) => callback(msg),
                Outbound::Runner(callback, msg) => callback(msg),
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    requesters: HashMap<String, RequesterEntry>,
    next_token: u64,
    runners: HashMap<String, RunnerEntry>,
    offers: OfferPool,
    tasks: HashMap<String, TaskEntry>,
    pending: HashMap<String, VecDeque<String>>,
}

impl BrokerState {
    fn to_requester(&self, out: &mut Outbox, requester_id: &str, msg: BrokerToRequester) {
        match self.requesters.get(requester_id) {
            Some(entry) => out.0.push(Outbound::Requester(Arc::clone(&entry.callback), msg)),
            None => debug!(requester_id, "requester gone, dropping message"),
        }
    }

    fn to_runner(&self, out: &mut Outbox, runner_id: &str, msg: BrokerToRunner) {
        match self.runners.get(runner_id) {
            Some(runner) => out.0.push(Outbound::Runner(Arc::clone(&runner.callback), msg)),
            None => debug!(runner_id, "runner gone, dropping message"),
        }
    }

    /// Whether `task_id` is currently bound to `runner_id`.
    fn is_bound_to(&self, task_id: &str, runner_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|t| t.state.runner_id() == Some(runner_id))
    }

    /// Remove a task and deliver its one and only result.
    fn finish(&mut self, out: &mut Outbox, task_id: &str, result: TaskResult) {
        let Some(entry) = self.tasks.remove(task_id) else {
            return;
        };
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        if entry.state == TaskState::Pending
            && let Some(queue) = self.pending.get_mut(&entry.task_type)
        {
            queue.retain(|id| id != task_id);
            if queue.is_empty() {
                self.pending.remove(&entry.task_type);
            }
        }

        info!(
            task_id,
            requester_id = %entry.requester_id,
            outcome = result.label(),
            "task finished"
        );
        self.to_requester(
            out,
            &entry.requester_id,
            BrokerToRequester::Result {
                task_id: task_id.to_string(),
                result,
            },
        );
    }

    /// Abort a task, telling its runner (if any) to stop.
    fn abort(&mut self, out: &mut Outbox, task_id: &str, reason: &str) {
        if let Some(runner_id) = self
            .tasks
            .get(task_id)
            .and_then(|t| t.state.runner_id())
            .map(str::to_string)
        {
            self.to_runner(
                out,
                &runner_id,
                BrokerToRunner::Cancel {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                },
            );
        }
        self.finish(out, task_id, TaskResult::aborted(reason));
    }

    /// Pair pending tasks of `task_type` with valid offers, oldest first.
    fn match_pending(&mut self, out: &mut Outbox, task_type: &str) {
        let now = Instant::now();
        loop {
            if !self.pending.get(task_type).is_some_and(|q| !q.is_empty()) {
                self.pending.remove(task_type);
                return;
            }
            let Some(offer) = self.offers.take_oldest_valid(task_type, now) else {
                return;
            };
            let Some(task_id) = self.pending.get_mut(task_type).and_then(|q| q.pop_front()) else {
                return;
            };
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                warn!(task_id = %task_id, "pending queue held a finished task");
                continue;
            };

            entry.state = TaskState::Offered {
                runner_id: offer.runner_id.clone(),
                offer_id: offer.offer_id.clone(),
            };
            debug!(
                task_id = %task_id,
                runner_id = %offer.runner_id,
                offer_id = %offer.offer_id,
                "task matched to offer"
            );
            self.to_runner(
                out,
                &offer.runner_id,
                BrokerToRunner::Assign {
                    task_id,
                    offer_id: offer.offer_id,
                    task_type: task_type.to_string(),
                },
            );
        }
    }

    /// Forget a runner, its offers, and every task bound to it.
    fn drop_runner(&mut self, out: &mut Outbox, runner_id: &str) -> usize {
        self.offers.remove_runner(runner_id);
        let bound: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.state.runner_id() == Some(runner_id))
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &bound {
            // The runner is gone; do not send it a cancel.
            self.finish(out, task_id, TaskResult::aborted(ABORT_RUNNER_DISCONNECTED));
        }
        bound.len()
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    settings: BrokerSettings,
}

/// Matchmaking registry between task requesters and runners.
#[derive(Clone)]
pub struct TaskBroker {
    inner: Arc<BrokerInner>,
}

impl Default for TaskBroker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl TaskBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> BrokerSettings {
        self.inner.settings
    }

    /// Run `f` inside the critical section, then deliver what it queued.
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState, &mut Outbox) -> T) -> T {
        let mut out = Outbox::default();
        let result = {
            let mut state = self.inner.state.lock();
            f(&mut state, &mut out)
        };
        out.deliver();
        result
    }

    // ── Requesters ──────────────────────────────────────────────────────

    /// Register (or re-register, after a reconnect) a requester.
    ///
    /// The returned token is needed to deregister this registration.
    pub fn register_requester(
        &self,
        requester_id: impl Into<String>,
        callback: RequesterCallback,
    ) -> RequesterToken {
        let requester_id = requester_id.into();
        let mut state = self.inner.state.lock();
        state.next_token += 1;
        let token = RequesterToken(state.next_token);
        let replaced = state
            .requesters
            .insert(requester_id.clone(), RequesterEntry { token, callback })
            .is_some();
        debug!(requester_id = %requester_id, replaced, "requester registered");
        token
    }

    /// Remove a requester registration and abort its outstanding tasks.
    ///
    /// Does nothing unless `token` belongs to the current registration of
    /// `requester_id`. Every outstanding task is settled with
    /// `Aborted("requester disconnected")` before the callback is dropped.
    pub fn deregister_requester(&self, requester_id: &str, token: RequesterToken) -> bool {
        self.with_state(|state, out| {
            match state.requesters.get(requester_id) {
                Some(entry) if entry.token == token => {}
                Some(_) => {
                    debug!(requester_id, "stale requester token, registration kept");
                    return false;
                }
                None => return false,
            }
            let owned: Vec<String> = state
                .tasks
                .iter()
                .filter(|(_, t)| t.requester_id == requester_id)
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in &owned {
                state.abort(out, task_id, ABORT_REQUESTER_DISCONNECTED);
            }
            state.requesters.remove(requester_id);
            debug!(requester_id, aborted = owned.len(), "requester deregistered");
            true
        })
    }

    /// Handle a message from a requester.
    ///
    /// Must be called from within a Tokio runtime: submissions with a deadline
    /// arm a timer task.
    pub fn on_requester_message(&self, requester_id: &str, message: RequesterMessage) -> Result<()> {
        self.with_state(|state, out| {
            if !state.requesters.contains_key(requester_id) {
                error!(requester_id, "message from unregistered requester");
                return Err(BrokerError::NotRegistered(requester_id.to_string()));
            }

            match message {
                RequesterMessage::Submit {
                    task_id,
                    task_type,
                    data,
                    timeout_ms,
                } => {
                    if state.tasks.contains_key(&task_id) {
                        warn!(task_id = %task_id, requester_id, "duplicate task id");
                        return Err(BrokerError::DuplicateTask(task_id));
                    }
                    let timeout = match timeout_ms {
                        None => Some(self.inner.settings.default_task_timeout),
                        Some(ms) => Some(Duration::from_millis(ms)),
                    }
                    .filter(|t| !t.is_zero());

                    debug!(
                        task_id = %task_id,
                        task_type = %task_type,
                        requester_id,
                        ?timeout,
                        "task submitted"
                    );
                    state.tasks.insert(
                        task_id.clone(),
                        TaskEntry {
                            task_type: task_type.clone(),
                            requester_id: requester_id.to_string(),
                            data,
                            deadline: timeout.map(|t| Instant::now() + t),
                            state: TaskState::Pending,
                            timer: timeout.map(|t| self.spawn_deadline(task_id.clone(), t)),
                        },
                    );
                    state
                        .pending
                        .entry(task_type.clone())
                        .or_default()
                        .push_back(task_id);
                    state.match_pending(out, &task_type);
                }

                RequesterMessage::Cancel { task_id } => {
                    let Some(entry) = state.tasks.get_mut(&task_id) else {
                        debug!(task_id = %task_id, "cancel for unknown or finished task");
                        return Ok(());
                    };
                    if entry.requester_id != requester_id {
                        warn!(task_id = %task_id, requester_id, "cancel for another requester's task");
                        return Ok(());
                    }
                    match &mut entry.state {
                        TaskState::Running {
                            runner_id,
                            cancel_requested,
                        } => {
                            // The runner's acknowledgement or its real result,
                            // whichever lands first, settles the task.
                            if *cancel_requested {
                                return Ok(());
                            }
                            *cancel_requested = true;
                            let runner_id = runner_id.clone();
                            debug!(task_id = %task_id, runner_id = %runner_id, "cancelling running task");
                            state.to_runner(
                                out,
                                &runner_id,
                                BrokerToRunner::Cancel {
                                    task_id,
                                    reason: ABORT_CANCELLED.to_string(),
                                },
                            );
                        }
                        TaskState::Pending | TaskState::Offered { .. } => {
                            state.abort(out, &task_id, ABORT_CANCELLED);
                        }
                    }
                }

                RequesterMessage::AbortAll { reason } => {
                    let owned: Vec<String> = state
                        .tasks
                        .iter()
                        .filter(|(_, t)| t.requester_id == requester_id)
                        .map(|(id, _)| id.clone())
                        .collect();
                    info!(requester_id, tasks = owned.len(), reason = %reason, "aborting all tasks");
                    for task_id in &owned {
                        state.abort(out, task_id, &reason);
                    }
                }
            }
            Ok(())
        })
    }

    fn spawn_deadline(&self, task_id: String, after: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                TaskBroker { inner }.expire_task(&task_id);
            }
        })
    }

    fn expire_task(&self, task_id: &str) {
        self.with_state(|state, out| {
            let Some(entry) = state.tasks.get(task_id) else {
                return;
            };
            let reason = match entry.state {
                TaskState::Pending => ABORT_NO_RUNNER,
                TaskState::Offered { .. } | TaskState::Running { .. } => ABORT_TIMED_OUT,
            };
            warn!(task_id, reason, "task deadline elapsed");
            state.abort(out, task_id, reason);
        });
    }

    // ── Runners ─────────────────────────────────────────────────────────

    /// Register a runner. Re-registering an id first drops the previous
    /// connection's offers and aborts its tasks.
    pub fn register_runner(&self, info: RunnerInfo, callback: RunnerCallback) {
        self.with_state(|state, out| {
            let runner_id = info.id.clone();
            if state.runners.contains_key(&runner_id) {
                let aborted = state.drop_runner(out, &runner_id);
                warn!(runner_id = %runner_id, aborted, "runner re-registered, previous session dropped");
            }
            info!(
                runner_id = %runner_id,
                name = %info.name,
                task_types = ?info.task_types,
                "runner registered"
            );
            state.runners.insert(runner_id, RunnerEntry { info, callback });
        });
    }

    /// Remove a runner. Every task bound to it is aborted with
    /// "runner disconnected"; none is handed to another runner.
    pub fn deregister_runner(&self, runner_id: &str, reason: &str) -> Result<()> {
        self.with_state(|state, out| {
            if state.runners.remove(runner_id).is_none() {
                warn!(runner_id, "deregister for unknown runner");
                return Err(BrokerError::RunnerNotRegistered(runner_id.to_string()));
            }
            // Callbacks were captured before removal, so the runner itself
            // receives nothing further.
            let aborted = state.drop_runner(out, runner_id);
            info!(runner_id, reason, aborted, "runner disconnected");
            Ok(())
        })
    }

    /// Handle a message from a runner.
    pub fn on_runner_message(&self, runner_id: &str, message: RunnerMessage) -> Result<()> {
        self.with_state(|state, out| {
            let Some(runner) = state.runners.get(runner_id) else {
                error!(runner_id, "message from unregistered runner");
                return Err(BrokerError::RunnerNotRegistered(runner_id.to_string()));
            };

            match message {
                RunnerMessage::Offer {
                    offer_id,
                    task_type,
                    valid_for_ms,
                } => {
                    if !runner.info.supports(&task_type) {
                        warn!(runner_id, task_type = %task_type, "offer for unsupported task type");
                        return Err(BrokerError::unsupported(runner_id, task_type));
                    }
                    let valid_for = if valid_for_ms == 0 {
                        self.inner.settings.offer_validity
                    } else {
                        Duration::from_millis(valid_for_ms)
                    };
                    state
                        .offers
                        .add(TaskOffer::new(offer_id, runner_id, task_type.clone(), valid_for));
                    state.match_pending(out, &task_type);
                }

                RunnerMessage::Accepted { task_id } => {
                    let Some(entry) = state.tasks.get_mut(&task_id) else {
                        debug!(task_id = %task_id, runner_id, "accept for unknown task");
                        return Ok(());
                    };
                    if !matches!(&entry.state, TaskState::Offered { runner_id: bound, .. } if bound == runner_id)
                    {
                        warn!(task_id = %task_id, runner_id, "accept for task not offered to this runner");
                        return Ok(());
                    }
                    entry.state = TaskState::Running {
                        runner_id: runner_id.to_string(),
                        cancel_requested: false,
                    };
                    let deadline_ms = entry.deadline.map(|d| {
                        let left = d.saturating_duration_since(Instant::now());
                        u64::try_from(left.as_millis()).unwrap_or(u64::MAX)
                    });
                    let data = entry.data.clone();
                    let requester_id = entry.requester_id.clone();

                    debug!(task_id = %task_id, runner_id, "task running");
                    state.to_runner(
                        out,
                        runner_id,
                        BrokerToRunner::Settings {
                            task_id: task_id.clone(),
                            data,
                            deadline_ms,
                        },
                    );
                    state.to_requester(out, &requester_id, BrokerToRequester::Accepted { task_id });
                }

                RunnerMessage::Rejected { task_id, reason } => {
                    let Some(entry) = state.tasks.get_mut(&task_id) else {
                        debug!(task_id = %task_id, runner_id, "reject for unknown task");
                        return Ok(());
                    };
                    if !matches!(&entry.state, TaskState::Offered { runner_id: bound, .. } if bound == runner_id)
                    {
                        warn!(task_id = %task_id, runner_id, "reject for task not offered to this runner");
                        return Ok(());
                    }
                    debug!(task_id = %task_id, runner_id, reason = %reason, "runner rejected task");
                    entry.state = TaskState::Pending;
                    let task_type = entry.task_type.clone();
                    // It never ran, so it keeps its place at the head of the queue.
                    state
                        .pending
                        .entry(task_type.clone())
                        .or_default()
                        .push_front(task_id);
                    state.match_pending(out, &task_type);
                }

                RunnerMessage::Done { task_id, data } => {
                    if state.is_bound_to(&task_id, runner_id) {
                        state.finish(out, &task_id, TaskResult::success(data));
                    } else {
                        debug!(task_id = %task_id, runner_id, "discarding result for task not bound here");
                    }
                }

                RunnerMessage::Error { task_id, error } => {
                    if state.is_bound_to(&task_id, runner_id) {
                        state.finish(out, &task_id, TaskResult::error(error));
                    } else {
                        debug!(task_id = %task_id, runner_id, "discarding error for task not bound here");
                    }
                }

                RunnerMessage::Cancelled { task_id } => {
                    if state.is_bound_to(&task_id, runner_id) {
                        state.finish(out, &task_id, TaskResult::aborted(ABORT_CANCELLED));
                    }
                }
            }
            Ok(())
        })
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .state
            .lock()
            .tasks
            .get(task_id)
            .map(|t| t.state.clone())
    }

    pub fn stats(&self) -> BrokerStats {
        let state = self.inner.state.lock();
        let mut stats = BrokerStats {
            requesters: state.requesters.len(),
            runners: state.runners.len(),
            offers: state.offers.valid_count(Instant::now()),
            ..BrokerStats::default()
        };
        for task in state.tasks.values() {
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Offered { .. } => stats.offered += 1,
                TaskState::Running { .. } => stats.running += 1,
            }
        }
        stats
    }
}
