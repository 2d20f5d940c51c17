//! Process-wide instance identity.
//!
//! The identity is created once at boot. The host id and instance type never
//! change afterwards; the role of a `main` instance may be flipped at runtime
//! by leader election.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// The kind of process this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// Owns workflow and trigger state, serves the control API.
    #[default]
    Main,
    /// Executes queued workloads.
    Worker,
    /// Receives inbound webhooks.
    Webhook,
}

impl InstanceType {
    /// Wire name of the instance type.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Main => "main",
            InstanceType::Worker => "worker",
            InstanceType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(InstanceType::Main),
            "worker" => Ok(InstanceType::Worker),
            "webhook" => Ok(InstanceType::Webhook),
            other => Err(TypesError::UnknownInstanceType(other.to_string())),
        }
    }
}

/// Role of a `main` instance in multi-main mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Leader,
    Follower,
}

impl InstanceRole {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Leader => "leader",
            InstanceRole::Follower => "follower",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceRole {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(InstanceRole::Leader),
            "follower" => Ok(InstanceRole::Follower),
            other => Err(TypesError::UnknownInstanceRole(other.to_string())),
        }
    }
}

/// Identity of the running process.
#[derive(Debug)]
pub struct InstanceIdentity {
    host_id: String,
    instance_type: InstanceType,
    role: RwLock<Option<InstanceRole>>,
}

/// Shared handle to the process identity.
pub type SharedIdentity = Arc<InstanceIdentity>;

impl InstanceIdentity {
    /// Create an identity with a generated host id of the form `<type>-<uuid>`.
    pub fn new(instance_type: InstanceType) -> Self {
        let host_id = format!("{}-{}", instance_type, uuid::Uuid::new_v4().simple());
        Self::with_host_id(host_id, instance_type)
    }

    /// Create an identity with an explicit host id.
    pub fn with_host_id(host_id: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            host_id: host_id.into(),
            instance_type,
            role: RwLock::new(None),
        }
    }

    /// Wrap this identity for sharing between components.
    pub fn shared(self) -> SharedIdentity {
        Arc::new(self)
    }

    /// Globally unique id of this process.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// Current role. Always `None` for worker and webhook instances.
    pub fn role(&self) -> Option<InstanceRole> {
        *self.role.read()
    }

    /// Update the role of a main instance, returning the previous role.
    ///
    /// Ignored (returns `None`) for worker and webhook instances, which never
    /// carry a role.
    pub fn set_role(&self, role: InstanceRole) -> Option<InstanceRole> {
        if self.instance_type != InstanceType::Main {
            return None;
        }
        self.role.write().replace(role)
    }

    pub fn is_main(&self) -> bool {
        self.instance_type == InstanceType::Main
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Some(InstanceRole::Leader)
    }
}
