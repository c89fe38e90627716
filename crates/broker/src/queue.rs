use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use relay_transport::Event;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounded event queue with a single consumer.
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    ready: Notify,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Appends an event, handing it back when the queue is full.
    pub(crate) fn push(&self, event: Event) -> Result<(), Event> {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                return Err(event);
            }
            events.push_back(event);
        }
        self.ready.notify_one();
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Drops every queued event, returning how many there were.
    pub(crate) fn clear(&self) -> usize {
        let mut events = self.events.lock();
        let count = events.len();
        events.clear();
        count
    }

    /// Waits for the next events, taking at most `max`.
    ///
    /// With a `linger`, waits up to that long after the first event for the
    /// batch to fill. Returns `None` once `cancel` fires.
    pub(crate) async fn next_batch(
        &self,
        max: usize,
        linger: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Option<Vec<Event>> {
        loop {
            let ready = self.ready.notified();
            if self.len() > 0 {
                break;
            }
            tokio::select! {
                () = ready => {}
                () = cancel.cancelled() => return None,
            }
        }

        if let Some(linger) = linger {
            let deadline = Instant::now() + linger;
            loop {
                let ready = self.ready.notified();
                if self.len() >= max {
                    break;
                }
                tokio::select! {
                    () = ready => {}
                    () = tokio::time::sleep_until(deadline) => break,
                    () = cancel.cancelled() => return None,
                }
            }
        }

        let mut events = self.events.lock();
        let take = events.len().min(max);
        Some(events.drain(..take).collect())
    }
}
