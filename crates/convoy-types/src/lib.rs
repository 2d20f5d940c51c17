//! Shared types for the Convoy fleet.
//!
//! Every process in a Convoy deployment (main, worker, or webhook instance)
//! carries an [`InstanceIdentity`] and exchanges [`Command`] and
//! [`WorkerResponse`] messages over a shared pub/sub broker. These types are
//! shared between `convoy-pubsub` (which moves them over the wire) and the
//! `convoy` binary (which reacts to them).

pub mod error;
pub mod instance;
pub mod message;
pub mod status;

pub use error::{Result, TypesError};
pub use instance::{InstanceIdentity, InstanceRole, InstanceType, SharedIdentity};
pub use message::{
    Channel, Command, CommandKind, CommandPolicy, OutboundCommand, ResponseKind, WorkerResponse,
};
pub use status::{WorkerId, WorkerStatus};
