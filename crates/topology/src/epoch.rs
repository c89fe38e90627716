use std::fmt;

use serde::{Deserialize, Serialize};

/// Election generation number.
///
/// Epochs are allocated ballot-style: a replica at index `i` of a group of `n`
/// replicas only ever claims epochs `e` with `e % n == i`, so two replicas can
/// never become master in the same epoch.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    /// The epoch every replica starts in before any election.
    pub const ZERO: Self = Self(0);

    /// Creates an epoch from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw epoch value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the smallest epoch strictly greater than `self` that belongs to
    /// the replica at `index` in a group of `group_size` replicas.
    #[must_use]
    pub const fn next_for(self, index: usize, group_size: usize) -> Self {
        let n = group_size as u64;
        let i = index as u64;
        if n == 0 {
            return Self(self.0 + 1);
        }
        let base = self.0 + 1;
        let offset = (i + n - base % n) % n;
        Self(base + offset)
    }

    /// Returns the index of the replica that owns this epoch.
    #[must_use]
    pub const fn owner(self, group_size: usize) -> usize {
        if group_size == 0 {
            return 0;
        }
        (self.0 % group_size as u64) as usize
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
