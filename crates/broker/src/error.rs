//! Error types for the broker data plane

use relay_topology::TopicRef;
use relay_transport::{ErrorKind, RemoteError};
use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by topic operations and mutation validation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The topic does not exist
    #[error("topic {0} does not exist")]
    NoSuchTopic(String),

    /// The topic already exists
    #[error("topic {0} already exists")]
    TopicExists(String),

    /// The identity is already subscribed
    #[error("{identity} is already subscribed to {topic}")]
    AlreadySubscribed {
        /// Topic name
        topic: String,
        /// Subscriber identity
        identity: String,
    },

    /// The remote topic is already linked
    #[error("{topic} is already linked to {remote}")]
    AlreadyLinked {
        /// Topic name
        topic: String,
        /// The linked remote topic
        remote: TopicRef,
    },

    /// The remote topic is not linked
    #[error("{topic} is not linked to {remote}")]
    NoSuchLink {
        /// Topic name
        topic: String,
        /// The remote topic
        remote: TopicRef,
    },

    /// The link cannot be created
    #[error("cannot link {topic}: {reason}")]
    InvalidLink {
        /// Topic name
        topic: String,
        /// Why the link was refused
        reason: String,
    },

    /// Sequence numbers could not be reserved
    #[error("cannot reserve sequence numbers for {topic}: {cause}")]
    Sequence {
        /// Topic name
        topic: String,
        /// Why the reservation failed
        cause: RemoteError,
    },

    /// Configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Wire classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchTopic(_) => ErrorKind::NoSuchTopic,
            Self::TopicExists(_) => ErrorKind::TopicExists,
            Self::AlreadySubscribed { .. } => ErrorKind::AlreadySubscribed,
            Self::AlreadyLinked { .. } => ErrorKind::AlreadyLinked,
            Self::NoSuchLink { .. } => ErrorKind::NoSuchLink,
            Self::InvalidLink { .. } => ErrorKind::InvalidLink,
            Self::Sequence { cause, .. } => cause.kind,
            Self::Config(_) => ErrorKind::Internal,
        }
    }
}

impl From<BrokerError> for RemoteError {
    fn from(error: BrokerError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}
