//! Fleet-wide command bus for Convoy.
//!
//! Every main, worker, and webhook instance shares one pub/sub broker. A state
//! change on one instance is published as a [`Command`](convoy_types::Command),
//! received by the [`Subscriber`] on every other instance, filtered and
//! debounced there, and finally dispatched onto the in-process
//! [`PubSubEventBus`] where the [`HandlerRegistry`] has bound business logic.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐        ┌────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ Publisher │──▶│ Transport │──···──▶│ Subscriber │──▶│ PubSubEventBus│──▶│ HandlerRegistry │
//! └───────────┘   └───────────┘ broker └────────────┘   └──────────────┘   └─────────────────┘
//!                                       self-send filter       on / off / emit    type + role filters
//!                                       targeting              (registration      rebuilt by
//!                                       trailing debounce       order)            reconfigure()
//! ```
//!
//! Publishing and subscribing each use their own transport connection so that
//! outbound writes never queue behind inbound delivery.

pub mod bus;
pub mod error;
pub mod leader;
pub mod publisher;
pub mod registry;
pub mod subscriber;
pub mod transport;

pub use bus::{EventHandler, HandlerId, PubSubEventBus};
pub use error::{PubSubError, Result};
pub use leader::{
    LEADER_KEY, LEADER_STEPDOWN_EVENT, LEADER_TAKEOVER_EVENT, LeaderElection, MIN_CHECK_INTERVAL,
};
pub use publisher::Publisher;
pub use registry::{HandlerFilter, HandlerRegistry};
pub use subscriber::{DEFAULT_DEBOUNCE, PubSubMessage, Subscriber};
pub use transport::{
    MemoryHub, MemoryTransport, MessageHandler, RedisTransport, SharedTransport, Transport,
    connect_publisher, connect_subscriber,
};
