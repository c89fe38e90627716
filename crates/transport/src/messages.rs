//! Requests and responses exchanged between broker instances

use std::fmt;

use relay_topology::{Epoch, NodeAddr};
use serde::{Deserialize, Serialize};

use crate::records::{
    CommitId, Event, LinkRecord, Mutation, RecordChange, StateSnapshot, SubscriptionRecord,
    TopicHandle,
};

/// Role a replica currently plays in its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Looking for a master, or running an election.
    Electing,
    /// Following a known master.
    Follower,
    /// Accepting mutations.
    Master,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Electing => "electing",
            Self::Follower => "follower",
            Self::Master => "master",
        };
        f.write_str(name)
    }
}

/// Point-in-time status of one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Address of the reporting replica.
    pub addr: NodeAddr,
    /// Its role.
    pub role: Role,
    /// Highest epoch it has seen.
    pub epoch: Epoch,
    /// The master it follows (itself when master).
    pub master: Option<NodeAddr>,
    /// Its last applied commit.
    pub commit: CommitId,
    /// Whether it is still catching up after a restart.
    pub catching_up: bool,
    /// Whether it refuses mutations after a fatal store failure.
    pub fatal: bool,
}

/// Error classification carried across the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The topic does not exist.
    NoSuchTopic,
    /// The topic already exists.
    TopicExists,
    /// The identity is already subscribed.
    AlreadySubscribed,
    /// The remote topic is already linked.
    AlreadyLinked,
    /// The remote topic is not linked.
    NoSuchLink,
    /// The link target is invalid.
    InvalidLink,
    /// This replica is not the master.
    NotMaster,
    /// No master is reachable.
    NoMaster,
    /// The replica is still catching up after a restart.
    CatchingUp,
    /// The message was issued under an older epoch.
    StaleEpoch,
    /// The sender claims an epoch that belongs to another replica.
    ForeignEpoch,
    /// Connectivity failure between replicas.
    ConnectFailed,
    /// The replica stopped accepting mutations after a store failure.
    Fatal,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether the caller may retry the call later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NotMaster | Self::NoMaster | Self::CatchingUp | Self::ConnectFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An error reported by the remote side of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// The master, when the error is `NotMaster`.
    pub master: Option<NodeAddr>,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            master: None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Administrative requests accepted by any replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Apply a mutation (forwarded to the master when needed).
    Mutate(Mutation),
    /// Look up a topic.
    Retrieve {
        /// Topic name.
        name: String,
    },
    /// List topic names.
    List,
    /// List a topic's links.
    Links {
        /// Topic name.
        topic: String,
    },
    /// List a topic's subscriptions.
    Subscribers {
        /// Topic name.
        topic: String,
    },
}

/// Requests a broker instance handles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Publish an event, either from a publisher or forwarded over a link.
    Publish {
        /// Topic name.
        topic: String,
        /// The event.
        event: Event,
    },

    /// Liveness probe for a linked topic.
    Probe {
        /// Topic name.
        topic: String,
    },

    /// Ask for the replica's status.
    Status,

    /// A replica announces its candidacy for `epoch`.
    Candidacy {
        /// The candidate.
        candidate: NodeAddr,
        /// The epoch it would lead.
        epoch: Epoch,
    },

    /// A replica announces it won the election for `epoch`.
    Elected {
        /// The new master.
        master: NodeAddr,
        /// Its epoch.
        epoch: Epoch,
        /// Its last commit.
        commit: CommitId,
    },

    /// Periodic master heartbeat.
    Heartbeat {
        /// The master.
        master: NodeAddr,
        /// Its epoch.
        epoch: Epoch,
        /// Its last commit.
        commit: CommitId,
    },

    /// A follower forwards a mutation to its master.
    Forward {
        /// The mutation.
        mutation: Mutation,
    },

    /// The master pushes a committed change.
    Replicate {
        /// The master.
        master: NodeAddr,
        /// Its epoch.
        epoch: Epoch,
        /// The commit the change applies on top of.
        previous: CommitId,
        /// The commit this change creates.
        commit: CommitId,
        /// The change.
        change: RecordChange,
    },

    /// The master pushes its complete state.
    InstallSnapshot {
        /// The master.
        master: NodeAddr,
        /// Its epoch.
        epoch: Epoch,
        /// The state.
        snapshot: StateSnapshot,
    },

    /// Ask for the replica's complete state.
    FetchSnapshot,

    /// Administrative call.
    Admin(AdminRequest),
}

impl Request {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Publish { .. } => "publish",
            Self::Probe { .. } => "probe",
            Self::Status => "status",
            Self::Candidacy { .. } => "candidacy",
            Self::Elected { .. } => "elected",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Forward { .. } => "forward",
            Self::Replicate { .. } => "replicate",
            Self::InstallSnapshot { .. } => "install-snapshot",
            Self::FetchSnapshot => "fetch-snapshot",
            Self::Admin(_) => "admin",
        }
    }
}

/// Responses to [`Request`]s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The request succeeded with nothing to return.
    Ok,

    /// Answer to `Publish`.
    Published {
        /// Sequence number the event carries.
        sequence: u64,
    },

    /// Answer to `Probe`.
    TopicStatus {
        /// Whether the topic exists.
        exists: bool,
    },

    /// Answer to `Status` and `Candidacy`.
    Status(ReplicaStatus),

    /// Answer to `FetchSnapshot`.
    Snapshot(StateSnapshot),

    /// The follower cannot apply a replicated change and needs a snapshot.
    NeedSync {
        /// The follower's last commit.
        commit: CommitId,
    },

    /// Answer to `Retrieve` and topic-creating mutations.
    Handle(TopicHandle),

    /// Answer to `List`.
    Topics(Vec<String>),

    /// Answer to `Links`.
    Links(Vec<LinkRecord>),

    /// Answer to `Subscribers`.
    Subscribers(Vec<SubscriptionRecord>),

    /// The request failed.
    Error(RemoteError),
}

impl Response {
    /// Convenience constructor for [`Response::Error`].
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(RemoteError::new(kind, message))
    }
}

