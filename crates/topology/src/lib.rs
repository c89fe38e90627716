//! Broker instance identity and replica group membership
//!
//! This crate provides:
//! - Address types for broker instances, subscriber endpoints and remote topics
//! - Election epochs
//! - The ordered replica group that makes up one logical broker
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod addr;
mod epoch;
mod error;
mod group;

pub use addr::{EndpointAddr, NodeAddr, TopicRef};
pub use epoch::Epoch;
pub use error::TopologyError;
pub use group::ReplicaGroup;
