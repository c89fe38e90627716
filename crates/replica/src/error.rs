//! Error types for the replica coordinator

use relay_broker::BrokerError;
use relay_topology::{Epoch, NodeAddr, TopologyError};
use relay_transport::{ErrorKind, RemoteError, TransportError};
use thiserror::Error;

/// Result type for replica operations
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors returned by the coordinator and its clients
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    /// A mutation was rejected by the data plane rules
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// This replica is not the master and will not forward
    #[error("not the master (master: {})", .master.as_ref().map_or("unknown", NodeAddr::as_str))]
    NotMaster {
        /// The current master, when known
        master: Option<NodeAddr>,
    },

    /// No master is currently reachable
    #[error("no master available")]
    NoMaster,

    /// The replica is still catching up after a restart
    #[error("replica is catching up")]
    CatchingUp,

    /// The replica stopped accepting mutations after a store failure
    #[error("replica is in a fatal state: {0}")]
    Fatal(String),

    /// A message from an older epoch was rejected
    #[error("stale epoch, current epoch is {0}")]
    StaleEpoch(Epoch),

    /// A replica claimed to lead an epoch it does not own
    #[error("{master} cannot lead epoch {epoch}")]
    ForeignEpoch {
        /// The claimed master
        master: NodeAddr,
        /// The claimed epoch
        epoch: Epoch,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The durable store failed
    #[error("store error: {0}")]
    Store(String),

    /// A stored value could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// An error reported by a remote replica
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// The replica group is invalid
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The remote side answered with a response of the wrong type
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

impl ReplicaError {
    /// Wire classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Broker(error) => error.kind(),
            Self::NotMaster { .. } => ErrorKind::NotMaster,
            Self::NoMaster => ErrorKind::NoMaster,
            Self::CatchingUp => ErrorKind::CatchingUp,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::StaleEpoch(_) => ErrorKind::StaleEpoch,
            Self::ForeignEpoch { .. } => ErrorKind::ForeignEpoch,
            Self::Transport(_) => ErrorKind::ConnectFailed,
            Self::Remote(error) => error.kind,
            Self::Store(_)
            | Self::Codec(_)
            | Self::Topology(_)
            | Self::Config(_)
            | Self::UnexpectedResponse(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the call later, possibly elsewhere.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The master hint carried by a `NotMaster` error.
    #[must_use]
    pub const fn master(&self) -> Option<&NodeAddr> {
        match self {
            Self::NotMaster { master } => master.as_ref(),
            Self::Remote(error) => error.master.as_ref(),
            _ => None,
        }
    }
}

impl From<ReplicaError> for RemoteError {
    fn from(error: ReplicaError) -> Self {
        match error {
            ReplicaError::Remote(remote) => remote,
            ReplicaError::NotMaster { master } => Self {
                kind: ErrorKind::NotMaster,
                message: "not the master".to_string(),
                master,
            },
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<RemoteError> for ReplicaError {
    fn from(error: RemoteError) -> Self {
        match error.kind {
            ErrorKind::NotMaster => Self::NotMaster {
                master: error.master,
            },
            ErrorKind::NoMaster => Self::NoMaster,
            ErrorKind::CatchingUp => Self::CatchingUp,
            ErrorKind::Fatal => Self::Fatal(error.message),
            _ => Self::Remote(error),
        }
    }
}
