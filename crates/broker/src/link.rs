use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relay_topology::TopicRef;
use relay_transport::{ErrorKind, Event, LinkRecord, Request, Response, Transport};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::queue::EventQueue;
use crate::stats::TopicStats;
use crate::topic::TopicContext;

/// A live outbound link: its forwarding queue and worker.
pub(crate) struct Link {
    origin: TopicRef,
    record: LinkRecord,
    queue: EventQueue,
    online: AtomicBool,
    cancel: CancellationToken,
    stats: Arc<TopicStats>,
}

impl Link {
    /// Creates the link and spawns its forwarding worker on `tracker`.
    pub(crate) fn start(
        ctx: &TopicContext,
        origin: TopicRef,
        record: LinkRecord,
        parent: &CancellationToken,
        tracker: &TaskTracker,
        stats: Arc<TopicStats>,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            origin,
            record,
            queue: EventQueue::new(ctx.config.topic.queue_size_max),
            online: AtomicBool::new(true),
            cancel: parent.child_token(),
            stats,
        });

        debug!("Starting link {} -> {}", link.origin, link.record.remote);

        let worker = Arc::clone(&link);
        let transport = Arc::clone(&ctx.transport);
        tracker.spawn(async move { worker.run(transport).await });

        link
    }

    pub(crate) const fn record(&self) -> &LinkRecord {
        &self.record
    }

    pub(crate) const fn remote(&self) -> &TopicRef {
        &self.record.remote
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether `event` travels over this link.
    ///
    /// An event never goes to a topic it already passed through, and a link
    /// with a non-zero cost only carries events that did not already cost
    /// more.
    pub(crate) fn carries(&self, event: &Event) -> bool {
        if event.visited(&self.record.remote) {
            return false;
        }
        self.record.cost == 0 || event.cost <= self.record.cost
    }

    /// Queues `event` for forwarding if this link carries it.
    pub(crate) fn offer(&self, event: &Event) {
        if !self.carries(event) {
            return;
        }

        if !self.is_online() {
            self.stats.record_dropped(1);
            return;
        }

        let mut forwarded = event.clone();
        forwarded.route.push(self.origin.clone());
        forwarded.origin = Some(self.origin.clone());
        forwarded.cost = self.record.cost;

        if self.queue.push(forwarded).is_err() {
            self.stats.record_dropped(1);
        }
    }

    /// Pauses forwarding. Returns `true` if the link was online.
    pub(crate) fn mark_offline(&self) -> bool {
        if !self.online.swap(false, Ordering::SeqCst) {
            return false;
        }

        warn!(
            "Link {} -> {}: subscriber offline",
            self.origin, self.record.remote
        );
        self.stats.record_dropped(self.queue.clear());
        true
    }

    /// Resumes forwarding. Returns `true` if the link was offline.
    pub(crate) fn mark_online(&self) -> bool {
        if self.online.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(
            "Link {} -> {}: subscriber online",
            self.origin, self.record.remote
        );
        true
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let remote = self.record.remote.clone();

        while let Some(events) = self.queue.next_batch(1, None, &self.cancel).await {
            for event in events {
                let request = Request::Publish {
                    topic: remote.topic.clone(),
                    event,
                };

                let result = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return,
                    result = transport.call(&remote.node, request) => result,
                };

                match result {
                    Ok(Response::Published { .. }) => self.stats.record_forwarded(),
                    Ok(Response::Error(e)) if e.kind == ErrorKind::NoSuchTopic => {
                        debug!("Remote topic {} is gone", remote);
                        self.stats.record_dropped(1);
                        self.mark_offline();
                    }
                    Ok(other) => {
                        debug!("Unexpected reply from {}: {:?}", remote, other);
                        self.stats.record_dropped(1);
                    }
                    Err(e) => {
                        debug!("Forwarding to {} failed: {}", remote, e);
                        self.stats.record_dropped(1);
                        self.mark_offline();
                    }
                }
            }
        }

        debug!("Link {} -> {} stopped", self.origin, remote);
    }
}
