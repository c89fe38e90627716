//! Error types for replica group construction

use thiserror::Error;

use crate::NodeAddr;

/// Topology-related errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The group has no replicas
    #[error("replica group is empty")]
    EmptyGroup,

    /// The same address appears twice
    #[error("replica {0} listed more than once")]
    DuplicateReplica(NodeAddr),

    /// The local replica is not part of the group
    #[error("replica {0} is not a member of the group")]
    NotAMember(NodeAddr),
}
