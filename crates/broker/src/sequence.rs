//! Sequence numbers of published events

use std::sync::Arc;

use async_trait::async_trait;
use relay_transport::RemoteError;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};

/// Numbers reserved with each write of a topic's high-water mark.
const RESERVE_BLOCK: u64 = 1024;

/// The share of every topic's sequence numbers one broker instance assigns.
///
/// Replica `index` of a group of `stride` replicas owns the numbers `s` with
/// `(s - 1) % stride == index`, so two replicas of a group never give out
/// the same number for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSpace {
    index: u64,
    stride: u64,
}

impl SequenceSpace {
    /// Every number, for a broker that is not replicated.
    pub const SINGLE: Self = Self {
        index: 0,
        stride: 1,
    };

    /// The share of replica `index` in a group of `group_size`.
    #[must_use]
    pub const fn new(index: usize, group_size: usize) -> Self {
        if group_size == 0 {
            return Self::SINGLE;
        }
        Self {
            index: (index % group_size) as u64,
            stride: group_size as u64,
        }
    }

    /// The smallest owned number strictly greater than `floor`.
    #[must_use]
    pub const fn next_after(self, floor: u64) -> u64 {
        let first = self.index + 1;
        if floor < first {
            return first;
        }
        let steps = (floor - first) / self.stride + 1;
        first.saturating_add(steps.saturating_mul(self.stride))
    }

    /// Whether this instance assigns `sequence`.
    #[must_use]
    pub const fn owns(self, sequence: u64) -> bool {
        sequence > 0 && (sequence - 1) % self.stride == self.index
    }
}

impl Default for SequenceSpace {
    fn default() -> Self {
        Self::SINGLE
    }
}

/// Durable high-water marks of topic sequence numbers.
///
/// A topic never assigns a number above the mark last stored for it, so
/// numbers handed out before a restart are not handed out again.
#[async_trait]
pub trait SequenceStore: Send + Sync + 'static {
    /// The stored mark of `topic`, zero when there is none.
    async fn high_water(&self, topic: &str) -> Result<u64, RemoteError>;

    /// Stores `mark` as the new high-water mark of `topic`.
    async fn reserve(&self, topic: &str, mark: u64) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy)]
struct Marks {
    last: u64,
    reserved: u64,
}

/// Assigns the sequence numbers of one topic.
pub(crate) struct Sequencer {
    topic: String,
    space: SequenceSpace,
    store: Arc<dyn SequenceStore>,
    marks: Mutex<Option<Marks>>,
}

impl Sequencer {
    pub(crate) fn new(topic: &str, space: SequenceSpace, store: Arc<dyn SequenceStore>) -> Self {
        Self {
            topic: topic.to_string(),
            space,
            store,
            marks: Mutex::new(None),
        }
    }

    /// Assigns the next number above both the last one and `floor`, then
    /// runs `publish` with it before the next number can be assigned.
    pub(crate) async fn assign<F: FnOnce(u64)>(&self, floor: u64, publish: F) -> BrokerResult<u64> {
        let mut marks = self.marks.lock().await;
        let current = match *marks {
            Some(current) => current,
            None => {
                let stored = self
                    .store
                    .high_water(&self.topic)
                    .await
                    .map_err(|cause| self.error(cause))?;
                Marks {
                    last: stored,
                    reserved: stored,
                }
            }
        };

        let sequence = self.space.next_after(current.last.max(floor));
        let mut reserved = current.reserved;
        if sequence > reserved {
            reserved = sequence.saturating_add(RESERVE_BLOCK);
            self.store
                .reserve(&self.topic, reserved)
                .await
                .map_err(|cause| self.error(cause))?;
            debug!("Reserved sequence numbers of {} up to {}", self.topic, reserved);
        }

        *marks = Some(Marks {
            last: sequence,
            reserved,
        });
        publish(sequence);
        Ok(sequence)
    }

    fn error(&self, cause: RemoteError) -> BrokerError {
        BrokerError::Sequence {
            topic: self.topic.clone(),
            cause,
        }
    }
}
