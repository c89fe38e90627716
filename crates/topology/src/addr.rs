use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a broker instance.
///
/// Replicas of a group and the remote managers of federated topics are both
/// named by a `NodeAddr`. Addresses are totally ordered; the replica election
/// uses that order to pick a winner.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr(String);

impl NodeAddr {
    /// Creates a new address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeAddr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque address of a subscriber endpoint, resolved by the transport.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddr(String);

impl EndpointAddr {
    /// Creates a new endpoint address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddr {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Reference to a topic hosted by some broker instance.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicRef {
    /// The broker instance hosting the topic.
    pub node: NodeAddr,

    /// The topic name on that instance.
    pub topic: String,
}

impl TopicRef {
    /// Creates a new topic reference.
    pub fn new(node: impl Into<NodeAddr>, topic: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for TopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic, self.node)
    }
}
