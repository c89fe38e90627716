use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{NodeAddr, TopologyError};

/// The ordered set of replicas that make up one logical broker.
///
/// Order matters: a replica's position in the group decides which epochs it
/// may claim (see [`crate::Epoch::next_for`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroup {
    replicas: Vec<NodeAddr>,
}

impl ReplicaGroup {
    /// Creates a group from the given replica addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or contains duplicates.
    pub fn new<I, A>(replicas: I) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = A>,
        A: Into<NodeAddr>,
    {
        let replicas: Vec<NodeAddr> = replicas.into_iter().map(Into::into).collect();
        if replicas.is_empty() {
            return Err(TopologyError::EmptyGroup);
        }

        let mut seen = HashSet::new();
        for replica in &replicas {
            if !seen.insert(replica) {
                return Err(TopologyError::DuplicateReplica(replica.clone()));
            }
        }

        Ok(Self { replicas })
    }

    /// Creates a group containing a single, non-replicated broker.
    pub fn single(addr: impl Into<NodeAddr>) -> Self {
        Self {
            replicas: vec![addr.into()],
        }
    }

    /// All replicas, in group order.
    #[must_use]
    pub fn replicas(&self) -> &[NodeAddr] {
        &self.replicas
    }

    /// Number of replicas in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether the group is empty. Never true for a constructed group.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Position of `addr` in the group.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::NotAMember`] if `addr` is not in the group.
    pub fn index_of(&self, addr: &NodeAddr) -> Result<usize, TopologyError> {
        self.replicas
            .iter()
            .position(|replica| replica == addr)
            .ok_or_else(|| TopologyError::NotAMember(addr.clone()))
    }

    /// Whether `addr` belongs to the group.
    #[must_use]
    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.replicas.contains(addr)
    }

    /// Every replica except `addr`.
    pub fn peers_of<'a>(&'a self, addr: &'a NodeAddr) -> impl Iterator<Item = &'a NodeAddr> {
        self.replicas.iter().filter(move |replica| *replica != addr)
    }
}
