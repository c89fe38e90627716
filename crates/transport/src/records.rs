//! Topic state and event types shared by every broker instance
//!
//! These types cross process boundaries twice: on the wire between replicas
//! and federated brokers, and in the durable store.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use relay_topology::{EndpointAddr, Epoch, NodeAddr, TopicRef};
use serde::{Deserialize, Serialize};

/// Delivery contract of a subscription.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosMode {
    /// Fire-and-forget, one event per call.
    Oneway,
    /// Each event is acknowledged; failures are retried.
    Twoway,
    /// Like `Twoway`, with at most one event in flight.
    Ordered,
    /// Events are flushed together, without acknowledgement.
    BatchOneway,
    /// Events are flushed together and the batch is acknowledged.
    BatchTwoway,
    /// Fire-and-forget over an unreliable channel.
    Datagram,
}

impl QosMode {
    /// Whether the endpoint acknowledges deliveries in this mode.
    #[must_use]
    pub const fn is_twoway(self) -> bool {
        matches!(self, Self::Twoway | Self::Ordered | Self::BatchTwoway)
    }

    /// Whether events are accumulated and flushed in batches.
    #[must_use]
    pub const fn is_batched(self) -> bool {
        matches!(self, Self::BatchOneway | Self::BatchTwoway)
    }
}

impl fmt::Display for QosMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Oneway => "oneway",
            Self::Twoway => "twoway",
            Self::Ordered => "ordered",
            Self::BatchOneway => "batch-oneway",
            Self::BatchTwoway => "batch-twoway",
            Self::Datagram => "datagram",
        };
        f.write_str(name)
    }
}

/// Quality of service requested by a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    /// Delivery contract.
    pub mode: QosMode,

    /// Retries before a twoway delivery is considered failed. `None` uses the
    /// topic default.
    pub retry_count: Option<u32>,
}

impl Qos {
    /// Creates a QoS with the topic's default retry count.
    #[must_use]
    pub const fn new(mode: QosMode) -> Self {
        Self {
            mode,
            retry_count: None,
        }
    }

    /// Oneway delivery.
    #[must_use]
    pub const fn oneway() -> Self {
        Self::new(QosMode::Oneway)
    }

    /// Twoway delivery.
    #[must_use]
    pub const fn twoway() -> Self {
        Self::new(QosMode::Twoway)
    }

    /// Ordered delivery.
    #[must_use]
    pub const fn ordered() -> Self {
        Self::new(QosMode::Ordered)
    }

    /// Overrides the retry count.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

/// A published event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Operation name supplied by the publisher.
    pub operation: String,

    /// Opaque payload.
    pub payload: Bytes,

    /// Publisher-supplied context.
    pub context: BTreeMap<String, String>,

    /// Sequence number assigned by the originating topic.
    ///
    /// On an event handed to a publish entry point by a publisher, the
    /// highest number the publisher has been given so far. The topic assigns
    /// a greater one.
    pub sequence: u64,

    /// Topic this event was forwarded from, if it arrived over a link.
    pub origin: Option<TopicRef>,

    /// Every topic that forwarded this event, oldest first.
    #[serde(default)]
    pub route: Vec<TopicRef>,

    /// Cost accumulated by forwarding; zero for directly published events.
    pub cost: u32,
}

impl Event {
    /// Creates an unsequenced event.
    pub fn new(operation: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            operation: operation.into(),
            payload: payload.into(),
            context: BTreeMap::new(),
            sequence: 0,
            origin: None,
            route: Vec::new(),
            cost: 0,
        }
    }

    /// Whether `topic` already forwarded this event.
    #[must_use]
    pub fn visited(&self, topic: &TopicRef) -> bool {
        self.origin.as_ref() == Some(topic) || self.route.contains(topic)
    }

    /// The topic that assigned this event's sequence number, `None` while
    /// the event has not left it.
    #[must_use]
    pub fn source(&self) -> Option<&TopicRef> {
        self.route.first().or(self.origin.as_ref())
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Durable description of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Subscriber identity, unique per topic.
    pub identity: String,

    /// Where events are delivered.
    pub endpoint: EndpointAddr,

    /// Requested quality of service.
    pub qos: Qos,
}

/// Durable description of an outbound link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// The linked remote topic.
    pub remote: TopicRef,

    /// Forwarding cost.
    pub cost: u32,
}

/// Durable state of one topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRecord {
    /// Topic name.
    pub name: String,

    /// Subscriptions keyed by identity.
    pub subscribers: BTreeMap<String, SubscriptionRecord>,

    /// Links keyed by remote topic.
    pub links: BTreeMap<TopicRef, LinkRecord>,
}

impl TopicRecord {
    /// Creates an empty record.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }
}

/// An administrative change to topic state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Create a topic.
    CreateTopic {
        /// Topic name.
        name: String,
    },

    /// Destroy a topic with all its subscriptions and links.
    DestroyTopic {
        /// Topic name.
        name: String,
    },

    /// Add a subscription.
    Subscribe {
        /// Topic name.
        topic: String,
        /// The subscription to add.
        subscription: SubscriptionRecord,
    },

    /// Remove a subscription. Succeeds when the identity is absent.
    Unsubscribe {
        /// Topic name.
        topic: String,
        /// Subscriber identity.
        identity: String,
    },

    /// Add an outbound link.
    Link {
        /// Topic name.
        topic: String,
        /// The link to add.
        link: LinkRecord,
    },

    /// Remove an outbound link.
    Unlink {
        /// Topic name.
        topic: String,
        /// The linked remote topic.
        remote: TopicRef,
    },
}

impl Mutation {
    /// The topic this mutation targets.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::CreateTopic { name } | Self::DestroyTopic { name } => name,
            Self::Subscribe { topic, .. }
            | Self::Unsubscribe { topic, .. }
            | Self::Link { topic, .. }
            | Self::Unlink { topic, .. } => topic,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTopic { name } => write!(f, "create {name}"),
            Self::DestroyTopic { name } => write!(f, "destroy {name}"),
            Self::Subscribe {
                topic,
                subscription,
            } => write!(
                f,
                "subscribe {} to {topic} ({})",
                subscription.identity, subscription.qos.mode
            ),
            Self::Unsubscribe { topic, identity } => write!(f, "unsubscribe {identity} from {topic}"),
            Self::Link { topic, link } => {
                write!(f, "link {topic} -> {} (cost {})", link.remote, link.cost)
            }
            Self::Unlink { topic, remote } => write!(f, "unlink {topic} -> {remote}"),
        }
    }
}

/// The effect of a committed mutation on durable state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordChange {
    /// The topic record now has this content.
    Put(TopicRecord),

    /// The topic no longer exists.
    Delete(String),
}

impl RecordChange {
    /// Name of the affected topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Put(record) => &record.name,
            Self::Delete(name) => name,
        }
    }
}

/// Identifies a commit: the epoch of the master that made it and its
/// position in the commit sequence.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CommitId {
    /// Epoch of the committing master.
    pub epoch: Epoch,

    /// Commit sequence number, one per mutation.
    pub version: u64,
}

impl CommitId {
    /// Creates a commit id.
    #[must_use]
    pub const fn new(epoch: Epoch, version: u64) -> Self {
        Self { epoch, version }
    }

    /// The commit that follows this one under `epoch`.
    #[must_use]
    pub const fn next(self, epoch: Epoch) -> Self {
        Self {
            epoch,
            version: self.version + 1,
        }
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.epoch, self.version)
    }
}

/// Complete topic state of a replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The last commit included in the snapshot.
    pub commit: CommitId,

    /// Every topic.
    pub topics: Vec<TopicRecord>,
}

/// Publisher-facing handle to a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicHandle {
    /// Topic name.
    pub name: String,

    /// Broker instances that accept publishes for the topic, in preference
    /// order.
    pub publish_endpoints: Vec<NodeAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_ordering_prefers_epoch() {
        let older = CommitId::new(Epoch::new(3), 10);
        let newer = CommitId::new(Epoch::new(5), 8);
        assert!(newer > older);
        assert_eq!(older.next(Epoch::new(3)), CommitId::new(Epoch::new(3), 11));
    }

    #[test]
    fn test_topic_record_survives_cbor() {
        let mut record = TopicRecord::new("fed1");
        record.subscribers.insert(
            "sub".to_string(),
            SubscriptionRecord {
                identity: "sub".to_string(),
                endpoint: EndpointAddr::from("client-1"),
                qos: Qos::ordered().with_retry_count(3),
            },
        );
        let remote = TopicRef::new("broker-y", "fed1");
        record.links.insert(
            remote.clone(),
            LinkRecord {
                remote,
                cost: 2,
            },
        );

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&record, &mut buf).unwrap();
        let decoded: TopicRecord = ciborium::de::from_reader(buf.as_slice()).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_mutation_topic() {
        let mutation = Mutation::Unlink {
            topic: "a".to_string(),
            remote: TopicRef::new("x", "b"),
        };
        assert_eq!(mutation.topic(), "a");
        assert_eq!(mutation.to_string(), "unlink a -> b@x");
    }

    #[test]
    fn test_route_remembers_every_hop() {
        let (a, b, c) = (
            TopicRef::new("x", "a"),
            TopicRef::new("x", "b"),
            TopicRef::new("x", "c"),
        );
        let mut event = Event::new("op", "x");
        assert_eq!(event.source(), None);

        // a -> b -> c, as links forward it.
        for hop in [&a, &b] {
            event.route.push(hop.clone());
            event.origin = Some(hop.clone());
        }

        assert_eq!(event.source(), Some(&a));
        assert!(event.visited(&a));
        assert!(event.visited(&b));
        assert!(!event.visited(&c));
    }
}
