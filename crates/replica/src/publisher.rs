use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use relay_transport::{Event, Request, Response, TopicHandle, Transport};
use tracing::debug;

use crate::error::{ReplicaError, ReplicaResult};

/// Publishes events to a topic through its publish endpoints.
///
/// Endpoints are tried in handle order, starting from the last one that
/// accepted an event; a connectivity failure moves on to the next endpoint.
///
/// Every event carries the highest sequence number this publisher was given
/// so far, and the replica taking it assigns a higher one. Sequence numbers
/// therefore keep growing when the publisher fails over to another replica.
pub struct Publisher {
    handle: TopicHandle,
    transport: Arc<dyn Transport>,
    preferred: AtomicUsize,
    last: AtomicU64,
}

impl Publisher {
    /// Creates a publisher for the topic behind `handle`.
    pub const fn new(handle: TopicHandle, transport: Arc<dyn Transport>) -> Self {
        Self {
            handle,
            transport,
            preferred: AtomicUsize::new(0),
            last: AtomicU64::new(0),
        }
    }

    /// Name of the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.handle.name
    }

    /// The handle this publisher was created from.
    #[must_use]
    pub const fn handle(&self) -> &TopicHandle {
        &self.handle
    }

    /// Highest sequence number assigned to an event of this publisher.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Publishes one event and returns the sequence number it was given.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchTopic` as reported by the broker, or the last
    /// connectivity error once every endpoint has failed.
    pub async fn publish(&self, mut event: Event) -> ReplicaResult<u64> {
        let endpoints = &self.handle.publish_endpoints;
        if endpoints.is_empty() {
            return Err(ReplicaError::Config(format!(
                "topic {} has no publish endpoints",
                self.handle.name
            )));
        }

        event.sequence = event.sequence.max(self.last_sequence());
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;
        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            let endpoint = &endpoints[index];
            let request = Request::Publish {
                topic: self.handle.name.clone(),
                event: event.clone(),
            };

            match self.transport.call(endpoint, request).await {
                Ok(Response::Published { sequence }) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    self.last.fetch_max(sequence, Ordering::SeqCst);
                    return Ok(sequence);
                }
                Ok(Response::Error(e)) => return Err(e.into()),
                Ok(_) => return Err(ReplicaError::UnexpectedResponse("publish")),
                Err(e) => {
                    debug!("Publish to {} via {} failed: {}", self.handle.name, endpoint, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or(ReplicaError::NoMaster, ReplicaError::Transport))
    }
}
