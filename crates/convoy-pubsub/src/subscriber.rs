//! Inbound side of the fleet bus.
//!
//! Every raw message from the subscribe connection goes through the same
//! pipeline before anything reacts to it:
//!
//! ```text
//! raw ──▶ parse ──▶ filter (commands only) ──▶ debounce? ──▶ PubSubEventBus::emit
//!          │          │                          │
//!          drop+log   own broadcast / not        per (channel, command) trailing
//!                     addressed to this host     timer, last payload wins
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use convoy_types::{Channel, Command, CommandKind, SharedIdentity, WorkerResponse};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus::PubSubEventBus;
use crate::transport::{MessageHandler, SharedTransport};

/// Trailing-edge window used when none is configured.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    Command(Command),
    WorkerResponse(WorkerResponse),
}

impl PubSubMessage {
    /// Local event name the message is dispatched under.
    pub fn event_name(&self) -> &'static str {
        match self {
            PubSubMessage::Command(cmd) => cmd.command.as_str(),
            PubSubMessage::WorkerResponse(resp) => resp.response.as_str(),
        }
    }
}

type DebounceKey = (Channel, CommandKind);

struct PendingDispatch {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceTimers {
    next_generation: u64,
    pending: HashMap<DebounceKey, PendingDispatch>,
}

struct Inner {
    identity: SharedIdentity,
    transport: SharedTransport,
    bus: PubSubEventBus,
    debounce: Duration,
    subscribed: Mutex<HashSet<Channel>>,
    timers: Mutex<DebounceTimers>,
}

/// Receives fleet messages on a dedicated connection and dispatches them onto
/// the local event bus.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    pub fn new(identity: SharedIdentity, transport: SharedTransport, bus: PubSubEventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                transport,
                bus,
                debounce: DEFAULT_DEBOUNCE,
                subscribed: Mutex::new(HashSet::new()),
                timers: Mutex::new(DebounceTimers::default()),
            }),
        }
    }

    /// Override the debounce window.
    ///
    /// Must be called before the subscriber is shared.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.debounce = debounce;
        } else {
            warn!("debounce window ignored: subscriber already shared");
        }
        self
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Subscribe to every fleet channel.
    pub async fn start(&self) {
        for channel in Channel::ALL {
            self.subscribe(channel).await;
        }
        info!(
            host_id = %self.inner.identity.host_id(),
            channels = ?self.subscribed_channels(),
            "fleet subscriber started"
        );
    }

    /// Subscribe to `channel` once. Failures are logged, not returned.
    pub async fn subscribe(&self, channel: Channel) {
        if !self.inner.subscribed.lock().insert(channel) {
            trace!(channel = %channel, "already subscribed");
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |channel, raw: &str| {
            if let Some(inner) = weak.upgrade() {
                Subscriber { inner }.on_raw_message(channel, raw);
            }
        });

        match self.inner.transport.subscribe(channel, handler).await {
            Ok(()) => debug!(channel = %channel, "subscribed"),
            Err(e) => {
                self.inner.subscribed.lock().remove(&channel);
                error!(channel = %channel, error = %e, "failed to subscribe");
            }
        }
    }

    /// Channels with an active subscription.
    pub fn subscribed_channels(&self) -> Vec<Channel> {
        let subscribed = self.inner.subscribed.lock();
        Channel::ALL
            .into_iter()
            .filter(|c| subscribed.contains(c))
            .collect()
    }

    /// Deserialize a raw payload received on `channel`.
    ///
    /// Malformed payloads are logged and yield `None`.
    pub fn parse_message(&self, raw: &str, channel: Channel) -> Option<PubSubMessage> {
        let parsed = match channel {
            Channel::Commands => serde_json::from_str(raw).map(PubSubMessage::Command),
            Channel::WorkerResponse => serde_json::from_str(raw).map(PubSubMessage::WorkerResponse),
        };
        match parsed {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(channel = %channel, error = %e, "dropping malformed pub/sub message");
                None
            }
        }
    }

    /// Whether this host should act on `command`.
    ///
    /// A host ignores its own broadcasts unless the command is marked
    /// self-send, and always ignores commands whose target list omits it.
    pub fn accepts(&self, command: &Command) -> bool {
        let host_id = self.inner.identity.host_id();
        if !command.self_send && command.sender_id == host_id {
            return false;
        }
        command.is_addressed_to(host_id)
    }

    /// Number of debounced dispatches waiting for their window to close.
    pub fn pending_dispatches(&self) -> usize {
        self.inner.timers.lock().pending.len()
    }

    /// Cancel every pending debounced dispatch.
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock();
        for (_, pending) in timers.pending.drain() {
            pending.task.abort();
        }
    }

    fn on_raw_message(&self, channel: Channel, raw: &str) {
        let Some(message) = self.parse_message(raw, channel) else {
            return;
        };

        match message {
            PubSubMessage::Command(command) => {
                if !self.accepts(&command) {
                    trace!(
                        command = %command.command,
                        sender_id = %command.sender_id,
                        "command not for this host"
                    );
                    return;
                }
                if command.debounce {
                    self.schedule(channel, command.command, command.payload);
                } else {
                    self.dispatch(command.command.as_str(), &command.payload);
                }
            }
            PubSubMessage::WorkerResponse(response) => {
                self.dispatch(response.response.as_str(), &response.payload);
            }
        }
    }

    fn dispatch(&self, event: &'static str, payload: &Value) {
        let handlers = self.inner.bus.emit(event, payload);
        debug!(event, handlers, "dispatched fleet message");
    }

    /// Restart the trailing window for `(channel, command)` carrying `payload`.
    fn schedule(&self, channel: Channel, command: CommandKind, payload: Value) {
        let key = (channel, command);
        let mut timers = self.inner.timers.lock();
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let weak = Arc::downgrade(&self.inner);
        let window = self.inner.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut timers = inner.timers.lock();
                // A newer arrival owns the key now.
                if timers.pending.get(&key).map(|p| p.generation) != Some(generation) {
                    return;
                }
                timers.pending.remove(&key);
            }
            Subscriber { inner }.dispatch(command.as_str(), &payload);
        });

        if let Some(previous) = timers
            .pending
            .insert(key, PendingDispatch { generation, task })
        {
            previous.task.abort();
            trace!(command = %command, "debounce window restarted");
        }
    }
}
