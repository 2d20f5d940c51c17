//! Fleet message types.
//!
//! Commands are fleet-wide directives published by one instance and acted on
//! by the others. Worker responses are replies to a previously issued command.
//! Both travel as one JSON object per message:
//!
//! ```text
//! {"command": "reload-license", "payload": {}, "senderId": "main-…",
//!  "selfSend": false, "debounce": true, "targets": ["worker-…"]}
//! {"response": "response-to-get-worker-status", "payload": {…}}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypesError;

/// Logical pub/sub topic used for fleet coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Commands,
    WorkerResponse,
}

impl Channel {
    /// Every channel a fleet subscriber listens on.
    pub const ALL: [Channel; 2] = [Channel::Commands, Channel::WorkerResponse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Commands => "commands",
            Channel::WorkerResponse => "worker-response",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commands" => Ok(Channel::Commands),
            "worker-response" => Ok(Channel::WorkerResponse),
            other => Err(TypesError::UnknownChannel(other.to_string())),
        }
    }
}

/// Every command the fleet understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    ReloadLicense,
    RestartEventBus,
    ReloadExternalSecretsProviders,
    CommunityPackageInstall,
    CommunityPackageUpdate,
    CommunityPackageUninstall,
    GetWorkerId,
    GetWorkerStatus,
    AddWebhooksTriggersAndPollers,
    RemoveTriggersAndPollers,
    DisplayWorkflowActivation,
    DisplayWorkflowDeactivation,
    DisplayWorkflowActivationError,
    RelayExecutionLifecycleEvent,
    ClearTestWebhooks,
}

/// Delivery policy attached to a command by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    /// The sender's own subscriber also dispatches the command.
    pub self_send: bool,
    /// Rapid repeats are coalesced by the receiving subscriber.
    pub debounce: bool,
}

impl CommandKind {
    /// All command kinds, in declaration order.
    pub const ALL: [CommandKind; 15] = [
        CommandKind::ReloadLicense,
        CommandKind::RestartEventBus,
        CommandKind::ReloadExternalSecretsProviders,
        CommandKind::CommunityPackageInstall,
        CommandKind::CommunityPackageUpdate,
        CommandKind::CommunityPackageUninstall,
        CommandKind::GetWorkerId,
        CommandKind::GetWorkerStatus,
        CommandKind::AddWebhooksTriggersAndPollers,
        CommandKind::RemoveTriggersAndPollers,
        CommandKind::DisplayWorkflowActivation,
        CommandKind::DisplayWorkflowDeactivation,
        CommandKind::DisplayWorkflowActivationError,
        CommandKind::RelayExecutionLifecycleEvent,
        CommandKind::ClearTestWebhooks,
    ];

    /// Wire name, also used as the local event bus event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ReloadLicense => "reload-license",
            CommandKind::RestartEventBus => "restart-event-bus",
            CommandKind::ReloadExternalSecretsProviders => "reload-external-secrets-providers",
            CommandKind::CommunityPackageInstall => "community-package-install",
            CommandKind::CommunityPackageUpdate => "community-package-update",
            CommandKind::CommunityPackageUninstall => "community-package-uninstall",
            CommandKind::GetWorkerId => "get-worker-id",
            CommandKind::GetWorkerStatus => "get-worker-status",
            CommandKind::AddWebhooksTriggersAndPollers => "add-webhooks-triggers-and-pollers",
            CommandKind::RemoveTriggersAndPollers => "remove-triggers-and-pollers",
            CommandKind::DisplayWorkflowActivation => "display-workflow-activation",
            CommandKind::DisplayWorkflowDeactivation => "display-workflow-deactivation",
            CommandKind::DisplayWorkflowActivationError => "display-workflow-activation-error",
            CommandKind::RelayExecutionLifecycleEvent => "relay-execution-lifecycle-event",
            CommandKind::ClearTestWebhooks => "clear-test-webhooks",
        }
    }

    /// The delivery policy table.
    ///
    /// Trigger activation changes must also reach the sender and must never sit
    /// behind a debounce window, or a fast "remove" could be reordered behind an
    /// earlier "add". Execution relays are per-execution and must not be
    /// coalesced either.
    pub fn policy(&self) -> CommandPolicy {
        match self {
            CommandKind::AddWebhooksTriggersAndPollers | CommandKind::RemoveTriggersAndPollers => {
                CommandPolicy {
                    self_send: true,
                    debounce: false,
                }
            }
            CommandKind::RelayExecutionLifecycleEvent | CommandKind::ClearTestWebhooks => {
                CommandPolicy {
                    self_send: false,
                    debounce: false,
                }
            }
            _ => CommandPolicy {
                self_send: false,
                debounce: true,
            },
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TypesError::UnknownCommand(s.to_string()))
    }
}

/// A command as published on the `commands` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command: CommandKind,
    #[serde(default)]
    pub payload: Value,
    pub sender_id: String,
    pub self_send: bool,
    pub debounce: bool,
    /// When present, only hosts listed here act on the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

impl Command {
    /// Whether `host_id` is addressed by this command's target list.
    pub fn is_addressed_to(&self, host_id: &str) -> bool {
        match &self.targets {
            None => true,
            Some(targets) => targets.iter().any(|t| t == host_id),
        }
    }
}

/// A command as requested by a caller, before the publisher stamps it.
///
/// Callers never choose the sender id or delivery policy; those are filled in
/// by [`OutboundCommand::into_command`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub command: CommandKind,
    pub payload: Value,
    pub targets: Option<Vec<String>>,
}

impl OutboundCommand {
    /// Create a broadcast command with an empty payload.
    pub fn new(command: CommandKind) -> Self {
        Self {
            command,
            payload: Value::Object(Default::default()),
            targets: None,
        }
    }

    /// Set the command payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Address the command to specific hosts only.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Stamp sender identity and delivery policy.
    pub fn into_command(self, sender_id: impl Into<String>) -> Command {
        let policy = self.command.policy();
        Command {
            command: self.command,
            payload: self.payload,
            sender_id: sender_id.into(),
            self_send: policy.self_send,
            debounce: policy.debounce,
            targets: self.targets,
        }
    }
}

/// Every worker response kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    ResponseToGetWorkerStatus,
    ResponseToGetWorkerId,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::ResponseToGetWorkerStatus => "response-to-get-worker-status",
            ResponseKind::ResponseToGetWorkerId => "response-to-get-worker-id",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply published on the `worker-response` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub response: ResponseKind,
    #[serde(default)]
    pub payload: Value,
}

impl WorkerResponse {
    pub fn new(response: ResponseKind, payload: Value) -> Self {
        Self { response, payload }
    }
}
