//! Topic data plane of the relay broker
//!
//! This crate owns everything a single broker instance does with events:
//! - [`TopicManager`]: the topics hosted by this instance and the publish entry point
//! - [`Topic`]: fan-out of published events to subscriptions and outbound links
//! - Per-subscription bounded queues drained by a delivery worker whose
//!   behavior is selected by a [`DeliveryStrategy`]
//! - [`LinkMonitor`]: periodic liveness probes of federated remote topics
//! - [`SequenceSpace`] and [`SequenceStore`]: per-replica sequence numbers
//!   that survive restarts and publisher failover
//!
//! Topic state is never changed here directly. Changes arrive as committed
//! [`relay_transport::RecordChange`]s, and changes the data plane wants to make
//! (evicting a slow subscriber, reaping a dead link) are submitted through a
//! [`MutationSink`] so they are replicated like any administrative call.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
mod delivery;
mod error;
mod link;
mod manager;
mod monitor;
mod queue;
mod record;
mod sequence;
mod sink;
mod stats;
mod subscriber;
mod topic;

#[cfg(test)]
mod testing;

pub use config::{BrokerConfig, DiscardConfig, FlushConfig, OverflowPolicy, SendConfig, TopicConfig};
pub use delivery::{DeliveryOutcome, DeliveryStrategy, DeliveryTarget, RetryPolicy, strategy_for};
pub use error::{BrokerError, BrokerResult};
pub use manager::TopicManager;
pub use monitor::LinkMonitor;
pub use record::plan_change;
pub use sequence::{SequenceSpace, SequenceStore};
pub use sink::MutationSink;
pub use stats::StatsSnapshot;
pub use topic::{Topic, TopicContext};
