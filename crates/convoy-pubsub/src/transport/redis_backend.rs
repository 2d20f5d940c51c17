//! Redis-backed transport.
//!
//! Channel names and coordination keys are namespaced with a prefix
//! (`<prefix>:commands`, `<prefix>:main_instance_leader`). The publishing role
//! uses a multiplexed connection; the subscribing role uses a dedicated
//! pub/sub connection owned by a background task. Each is opened lazily on
//! first use, so a transport used for only one role holds only one connection.

use std::collections::HashMap;
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use convoy_types::Channel;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSub};
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{MessageHandler, Transport};
use crate::error::{PubSubError, Result};

struct SubscribeRequest {
    channel: Channel,
    handler: MessageHandler,
    ack: oneshot::Sender<Result<()>>,
}

/// A connection to a Redis broker.
pub struct RedisTransport {
    client: redis::Client,
    prefix: String,
    commands: OnceCell<MultiplexedConnection>,
    subscriptions: Mutex<Option<mpsc::UnboundedSender<SubscribeRequest>>>,
}

impl RedisTransport {
    /// Create a transport for `url`. No connection is opened until first use.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            commands: OnceCell::new(),
            subscriptions: Mutex::new(None),
        })
    }

    /// Create a transport and open its command connection eagerly, failing fast
    /// when the broker is unreachable.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let transport = Self::new(url, prefix)?;
        transport.connection().await?;
        info!(prefix = %transport.prefix, "connected to redis");
        Ok(transport)
    }

    fn channel_name(&self, channel: Channel) -> String {
        format!("{}:{}", self.prefix, channel)
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .commands
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(PubSubError::from)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn subscription_sender(&self) -> Result<mpsc::UnboundedSender<SubscribeRequest>> {
        let mut guard = self.subscriptions.lock().await;
        if let Some(tx) = guard.as_ref()
            && !tx.is_closed()
        {
            return Ok(tx.clone());
        }

        let pubsub = self.client.get_async_pubsub().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pubsub(pubsub, rx, self.prefix.clone()));
        debug!(prefix = %self.prefix, "opened redis pub/sub connection");
        *guard = Some(tx.clone());
        Ok(tx)
    }
}

/// Drive the pub/sub connection: stream messages to handlers and accept new
/// subscriptions in between.
async fn run_pubsub(
    mut pubsub: PubSub,
    mut requests: mpsc::UnboundedReceiver<SubscribeRequest>,
    prefix: String,
) {
    let mut handlers: HashMap<String, (Channel, MessageHandler)> = HashMap::new();

    loop {
        let request = {
            let mut messages = pin!(pubsub.on_message());
            tokio::select! {
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!(prefix = %prefix, "redis pub/sub connection closed");
                        return;
                    };
                    let name = msg.get_channel_name().to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if let Some((channel, handler)) = handlers.get(&name) {
                                handler(*channel, &payload);
                            }
                        }
                        Err(e) => {
                            warn!(channel = %name, error = %e, "dropping non-text pub/sub payload");
                        }
                    }
                    continue;
                }
                request = requests.recv() => request,
            }
        };

        let Some(request) = request else {
            debug!(prefix = %prefix, "redis transport dropped, closing pub/sub connection");
            return;
        };

        let name = format!("{}:{}", prefix, request.channel);
        let result = pubsub.subscribe(&name).await.map_err(PubSubError::from);
        if result.is_ok() {
            handlers.insert(name, (request.channel, request.handler));
        }
        let _ = request.ack.send(result);
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: Channel, payload: String) -> Result<()> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(self.channel_name(channel), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: Channel, handler: MessageHandler) -> Result<()> {
        let sender = self.subscription_sender().await?;
        let (ack, done) = oneshot::channel();
        sender
            .send(SubscribeRequest {
                channel,
                handler,
                ack,
            })
            .map_err(|_| PubSubError::transport("pub/sub connection closed"))?;
        done.await
            .map_err(|_| PubSubError::transport("pub/sub connection closed"))?
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        Ok(conn.set_nx(self.key(key), value).await?)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let _applied: bool = conn.pexpire(self.key(key), millis).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(self.key(key)).await?)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _removed: i64 = conn.del(self.key(key)).await?;
        Ok(())
    }
}
