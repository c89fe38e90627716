use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_transport::{Event, SubscriberHandler};
use tokio::sync::{Notify, watch};

struct EndpointState {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
    stalled: watch::Sender<bool>,
    arrived: Notify,
}

/// A subscriber endpoint that records every delivered event.
///
/// The endpoint can be told to reject deliveries or to hold them until
/// released, which is how tests model failing and slow subscribers.
#[derive(Clone)]
pub struct RecordingEndpoint {
    state: Arc<EndpointState>,
}

impl Default for RecordingEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEndpoint {
    /// Creates an endpoint that accepts every delivery.
    #[must_use]
    pub fn new() -> Self {
        let (stalled, _) = watch::channel(false);
        Self {
            state: Arc::new(EndpointState {
                events: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                stalled,
                arrived: Notify::new(),
            }),
        }
    }

    /// Makes deliveries fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Holds deliveries until called again with `false`.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.send_replace(stalled);
    }

    /// Every event received so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    /// Sequence numbers of the received events, in arrival order.
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        self.state.events.lock().iter().map(|e| e.sequence).collect()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.events.lock().len()
    }

    /// Whether nothing has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets the received events.
    pub fn clear(&self) {
        self.state.events.lock().clear();
    }

    /// Waits until at least `count` events have arrived. Returns `false` if
    /// `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let arrived = self.state.arrived.notified();
                if self.len() >= count {
                    return;
                }
                arrived.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl SubscriberHandler for RecordingEndpoint {
    async fn handle(&self, events: Vec<Event>) -> Result<(), String> {
        let mut stalled = self.state.stalled.subscribe();
        stalled
            .wait_for(|stalled| !*stalled)
            .await
            .map_err(|e| e.to_string())?;

        if self.state.failing.load(Ordering::SeqCst) {
            return Err("endpoint is failing".to_string());
        }

        self.state.events.lock().extend(events);
        self.state.arrived.notify_waiters();
        Ok(())
    }
}
