//! In-process broker.
//!
//! A [`MemoryHub`] stands in for the shared network broker when several
//! instances live in one process (tests, single-binary deployments). Each
//! [`MemoryTransport`] obtained from [`MemoryHub::connect`] behaves like one
//! broker connection. Publishing delivers synchronously to every subscribed
//! connection, in subscription order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use convoy_types::Channel;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::trace;

use super::{MessageHandler, Transport};
use crate::error::{PubSubError, Result};

struct Subscription {
    connection: u64,
    channel: Channel,
    handler: MessageHandler,
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct HubInner {
    subscriptions: RwLock<Vec<Subscription>>,
    store: Mutex<HashMap<String, StoredValue>>,
    next_connection: AtomicU64,
    offline: AtomicBool,
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this hub.
    pub fn connect(&self) -> MemoryTransport {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        MemoryTransport {
            hub: self.clone(),
            connection: id,
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    ///
    /// While offline every operation fails with a transport error.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of active channel subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(PubSubError::transport("broker unavailable"));
        }
        Ok(())
    }
}

/// One connection to a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    connection: u64,
}

impl MemoryTransport {
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: Channel, payload: String) -> Result<()> {
        self.hub.ensure_online()?;

        // Snapshot handlers so a handler may subscribe or publish reentrantly.
        let handlers: Vec<MessageHandler> = self
            .hub
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.channel == channel)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        trace!(
            channel = %channel,
            receivers = handlers.len(),
            "memory hub delivering message"
        );
        for handler in handlers {
            handler(channel, &payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel, handler: MessageHandler) -> Result<()> {
        self.hub.ensure_online()?;

        let mut subscriptions = self.hub.inner.subscriptions.write();
        if let Some(existing) = subscriptions
            .iter_mut()
            .find(|s| s.connection == self.connection && s.channel == channel)
        {
            existing.handler = handler;
        } else {
            subscriptions.push(Subscription {
                connection: self.connection,
                channel,
                handler,
            });
        }
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool> {
        self.hub.ensure_online()?;

        let mut store = self.hub.inner.store.lock();
        if store.get(key).is_some_and(|v| !v.is_expired()) {
            return Ok(false);
        }
        store.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        self.hub.ensure_online()?;

        if let Some(stored) = self.hub.inner.store.lock().get_mut(key) {
            stored.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.hub.ensure_online()?;

        let mut store = self.hub.inner.store.lock();
        if store.get(key).is_some_and(StoredValue::is_expired) {
            store.remove(key);
        }
        Ok(store.get(key).map(|v| v.value.clone()))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.hub.ensure_online()?;
        self.hub.inner.store.lock().remove(key);
        Ok(())
    }
}
