//! Leader election between main instances.
//!
//! The leader holds a single expiring key on the shared broker and renews it
//! every check interval. A leader that stops renewing (crash, partition) loses
//! the key after its TTL and the next follower to check takes over.

use std::sync::Arc;
use std::time::Duration;

use convoy_types::{InstanceRole, SharedIdentity};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::PubSubEventBus;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::registry::HandlerRegistry;

/// Coordination key holding the leader's host id.
pub const LEADER_KEY: &str = "main_instance_leader";

/// Local event emitted when this instance becomes leader.
pub const LEADER_TAKEOVER_EVENT: &str = "leader-takeover";

/// Local event emitted when this instance stops being leader.
pub const LEADER_STEPDOWN_EVENT: &str = "leader-stepdown";

/// Shortest accepted interval between election rounds.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Periodic leader check for one main instance.
pub struct LeaderElection {
    identity: SharedIdentity,
    publisher: Publisher,
    registry: HandlerRegistry,
    bus: PubSubEventBus,
    ttl: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl LeaderElection {
    pub fn new(
        identity: SharedIdentity,
        publisher: Publisher,
        registry: HandlerRegistry,
        bus: PubSubEventBus,
    ) -> Self {
        Self {
            identity,
            publisher,
            registry,
            bus,
            ttl: Duration::from_secs(10),
            check_interval: Duration::from_secs(3),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the round interval, raised to at least [`MIN_CHECK_INTERVAL`].
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Take the leader role without an election (single main deployment).
    pub fn assume_leadership(&self) {
        self.apply_role(InstanceRole::Leader);
    }

    /// Run one election round and apply the resulting role.
    pub async fn check_leader(&self) -> Result<InstanceRole> {
        let host_id = self.identity.host_id();
        let role = match self.publisher.get(LEADER_KEY).await? {
            Some(leader) if leader == host_id => {
                self.publisher.set_expiration(LEADER_KEY, self.ttl).await?;
                InstanceRole::Leader
            }
            Some(leader) => {
                debug!(leader = %leader, "another instance leads");
                InstanceRole::Follower
            }
            None => {
                if self.publisher.set_if_not_exists(LEADER_KEY, host_id).await? {
                    self.publisher.set_expiration(LEADER_KEY, self.ttl).await?;
                    InstanceRole::Leader
                } else {
                    InstanceRole::Follower
                }
            }
        };
        self.apply_role(role);
        Ok(role)
    }

    /// Record `role` on the identity. On a change, rebind handlers and emit the
    /// takeover or stepdown event. Returns whether the role changed.
    pub fn apply_role(&self, role: InstanceRole) -> bool {
        let previous = self.identity.set_role(role);
        if previous == Some(role) || !self.identity.is_main() {
            return false;
        }

        info!(
            host_id = %self.identity.host_id(),
            ?previous,
            role = %role,
            "instance role changed"
        );
        self.registry.reconfigure();

        let payload = json!({ "hostId": self.identity.host_id() });
        match role {
            InstanceRole::Leader => {
                self.bus.emit(LEADER_TAKEOVER_EVENT, &payload);
            }
            InstanceRole::Follower if previous == Some(InstanceRole::Leader) => {
                self.bus.emit(LEADER_STEPDOWN_EVENT, &payload);
            }
            InstanceRole::Follower => {}
        }
        true
    }

    /// Run election rounds every check interval until [`shutdown`](Self::shutdown).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.check_leader().await {
                    warn!(error = %e, "leader check failed");
                    // Without the broker we cannot prove we still hold the key.
                    if self.identity.is_leader() {
                        self.apply_role(InstanceRole::Follower);
                    }
                }
            }
            debug!("leader election loop stopped");
        })
    }

    /// Stop the election loop and release the key if this instance holds it.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        if !self.identity.is_leader() {
            return Ok(());
        }
        if self.publisher.get(LEADER_KEY).await?.as_deref() == Some(self.identity.host_id()) {
            self.publisher.clear(LEADER_KEY).await?;
            info!(host_id = %self.identity.host_id(), "released leadership");
        }
        self.apply_role(InstanceRole::Follower);
        Ok(())
    }
}
