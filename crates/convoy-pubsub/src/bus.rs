//! In-process event bus.
//!
//! Decouples the subscriber from business logic: the subscriber emits one
//! event per dispatched message, named after the command or response, and
//! anything interested registers a handler with [`PubSubEventBus::on`].
//! Emission is synchronous and follows registration order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// Handler invoked with the event payload.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by [`PubSubEventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct BusState {
    next_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
}

/// Synchronous, typed-by-name event emitter.
#[derive(Clone, Default)]
pub struct PubSubEventBus {
    state: Arc<RwLock<BusState>>,
}

impl PubSubEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_shared(event, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn on_shared(&self, event: &str, handler: EventHandler) -> HandlerId {
        let mut state = self.state.write();
        let id = HandlerId(state.next_id);
        state.next_id += 1;
        state
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut state = self.state.write();
        let Some(list) = state.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            state.handlers.remove(event);
        }
        removed
    }

    /// Invoke every handler for `event`, returning how many ran.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Handlers may register or remove handlers, so call them unlocked.
        let handlers: Vec<EventHandler> = match self.state.read().handlers.get(event) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => Vec::new(),
        };
        trace!(event, handlers = handlers.len(), "emitting local event");
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.state
            .read()
            .handlers
            .get(event)
            .map_or(0, |list| list.len())
    }
}

impl std::fmt::Debug for PubSubEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PubSubEventBus")
            .field("events", &state.handlers.len())
            .finish()
    }
}
