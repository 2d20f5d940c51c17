//! Sandboxed task distribution for Convoy.
//!
//! User-authored script fragments never run inside a trusted instance. The
//! execution engine hands them to a [`TaskRequester`]; the [`TaskBroker`]
//! matches each task to an offer from an isolated runner process and routes
//! the [`TaskResult`] back to exactly the requester that asked.
//!
//! Execution is at most once: a task whose runner disconnects is aborted, not
//! silently handed to another runner.

pub mod broker;
pub mod error;
pub mod offers;
pub mod protocol;
pub mod requester;

pub use broker::{BrokerSettings, BrokerStats, RequesterToken, TaskBroker, TaskState};
pub use error::{BrokerError, Result};
pub use offers::{OfferPool, TaskOffer};
pub use protocol::{
    ABORT_CANCELLED, ABORT_NO_RUNNER, ABORT_REQUESTER_DISCONNECTED, ABORT_RUNNER_DISCONNECTED,
    ABORT_TIMED_OUT, BrokerToRequester, BrokerToRunner, RequesterCallback, RequesterMessage, RunnerCallback,
    RunnerInfo, RunnerMessage, TaskResult,
};
pub use requester::{ABORT_BROKER_SHUT_DOWN, LocalTaskRequester, TaskHandle, TaskRequester};
