//! Outbound side of the fleet bus.

use std::time::Duration;

use convoy_types::{Channel, CommandKind, OutboundCommand, SharedIdentity, WorkerResponse};
use tracing::{debug, error};

use crate::error::{PubSubError, Result};
use crate::transport::SharedTransport;

/// Turns business intents into wire messages on the publish connection.
///
/// In single-instance mode (`scaling_enabled == false`) publishing commands is
/// a no-op: there is nobody else to tell.
#[derive(Clone)]
pub struct Publisher {
    identity: SharedIdentity,
    transport: Option<SharedTransport>,
    scaling_enabled: bool,
}

impl Publisher {
    pub fn new(
        identity: SharedIdentity,
        transport: Option<SharedTransport>,
        scaling_enabled: bool,
    ) -> Self {
        Self {
            identity,
            transport,
            scaling_enabled,
        }
    }

    /// A publisher for a process running without a shared broker.
    pub fn disabled(identity: SharedIdentity) -> Self {
        Self::new(identity, None, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.scaling_enabled
    }

    fn transport(&self) -> Result<&SharedTransport> {
        self.transport.as_ref().ok_or(PubSubError::NotConnected)
    }

    /// Stamp sender id and delivery policy on `outbound` and publish it on the
    /// `commands` channel.
    pub async fn publish_command(&self, outbound: OutboundCommand) -> Result<()> {
        if !self.scaling_enabled {
            return Ok(());
        }
        let transport = self.transport()?;

        let command = outbound.into_command(self.identity.host_id());
        let payload = serde_json::to_string(&command)?;

        if command.command == CommandKind::RelayExecutionLifecycleEvent {
            let execution_id = command
                .payload
                .get("executionId")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            debug!(
                command = %command.command,
                execution_id,
                "publishing command"
            );
        } else {
            debug!(
                command = %command.command,
                targets = ?command.targets,
                "publishing command"
            );
        }

        transport
            .publish(Channel::Commands, payload)
            .await
            .inspect_err(|e| {
                error!(command = %command.command, error = %e, "failed to publish command");
            })
    }

    /// Publish a reply on the `worker-response` channel.
    ///
    /// Silently skipped when no transport exists.
    pub async fn publish_worker_response(&self, response: WorkerResponse) -> Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            return Ok(());
        };
        let payload = serde_json::to_string(&response)?;
        debug!(response = %response.response, "publishing worker response");
        transport
            .publish(Channel::WorkerResponse, payload)
            .await
            .inspect_err(|e| {
                error!(response = %response.response, error = %e, "failed to publish worker response");
            })
    }

    // ── Key/value utilities used by leader election ─────────────────────

    pub async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool> {
        self.transport()?.set_if_not_exists(key, value).await
    }

    pub async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<()> {
        self.transport()?.set_expiration(key, ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.transport()?.get(key).await
    }

    pub async fn clear(&self, key: &str) -> Result<()> {
        self.transport()?.clear(key).await
    }
}
