//! Replicated control plane of the relay broker
//!
//! A replicated broker is a [`ReplicaGroup`](relay_topology::ReplicaGroup) of
//! broker instances, each running a [`Coordinator`]. The coordinators elect a
//! single master, which is the only replica that commits topic mutations
//! (create, destroy, subscribe, unsubscribe, link, unlink). Followers forward
//! mutations to it, apply the changes it pushes, and keep serving reads and
//! deliveries from their last committed state while no master is available.
//!
//! Remote callers use [`AdminClient`] for administration and [`Publisher`] to
//! publish with failover across the publish endpoints of a topic.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
pub mod config;
mod coordinator;
mod durable;
mod election;
mod error;
mod publisher;
mod replication;

pub use client::AdminClient;
pub use config::{ElectionConfig, ReplicaConfig};
pub use coordinator::Coordinator;
pub use durable::{DurableState, Recovered};
pub use error::{ReplicaError, ReplicaResult};
pub use publisher::Publisher;
