//! Transport layer for fleet messages.
//!
//! A transport is one connection to the shared broker. It moves opaque string
//! payloads over named channels and offers a handful of key/value primitives
//! used by leader election on the same broker.

mod memory;
mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_types::Channel;

use crate::error::Result;

pub use self::memory::{MemoryHub, MemoryTransport};
pub use self::redis_backend::RedisTransport;

/// Callback invoked for every raw message received on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(Channel, &str) + Send + Sync>;

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// A single connection to the pub/sub broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to every subscriber of `channel`.
    async fn publish(&self, channel: Channel, payload: String) -> Result<()>;

    /// Deliver every future message on `channel` to `handler`.
    async fn subscribe(&self, channel: Channel, handler: MessageHandler) -> Result<()>;

    /// Set `key` to `value` only if it does not exist. Returns whether it was set.
    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool>;

    /// Expire `key` after `ttl`.
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Read `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`.
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Open the publish-role connection to a Redis broker.
///
/// Fails when the broker cannot be reached.
pub async fn connect_publisher(url: &str, prefix: &str) -> Result<SharedTransport> {
    Ok(Arc::new(RedisTransport::connect(url, prefix).await?))
}

/// Create the subscribe-role connection to a Redis broker.
///
/// The pub/sub connection itself is opened by the first subscription.
pub fn connect_subscriber(url: &str, prefix: &str) -> Result<SharedTransport> {
    Ok(Arc::new(RedisTransport::new(url, prefix)?))
}
