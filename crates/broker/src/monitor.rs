//! Federation link liveness monitoring

use std::sync::Arc;
use std::time::Duration;

use relay_transport::{Mutation, Request, Response};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::link::Link;
use crate::manager::TopicManager;

/// Periodically probes the remote topic of every outbound link.
///
/// A failed probe pauses the link, a successful one resumes it. When the
/// remote instance answers that the topic no longer exists, the master
/// submits an unlink so every replica drops the link.
pub struct LinkMonitor {
    manager: Arc<TopicManager>,
    interval: Duration,
}

impl LinkMonitor {
    /// Create a new link monitor probing every `Discard.Interval`
    #[must_use]
    pub fn new(manager: Arc<TopicManager>) -> Self {
        let interval = manager.config().discard.interval;
        Self { manager, interval }
    }

    /// Start monitoring links
    pub fn start_monitoring(
        self: Arc<Self>,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) {
        let token = cancellation_token.clone();

        task_tracker.spawn(async move {
            info!("Starting link monitor (interval {:?})", self.interval);

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_links().await,
                    () = token.cancelled() => {
                        info!("Link monitor shutting down");
                        return;
                    }
                }
            }
        });
    }

    /// Probes every link once.
    pub async fn check_links(&self) {
        for topic in self.manager.topics() {
            for link in topic.links() {
                self.check_link(topic.name(), &link).await;
            }
        }
    }

    async fn check_link(&self, topic: &str, link: &Link) {
        let ctx = self.manager.context();
        let remote = link.remote();
        let probe = Request::Probe {
            topic: remote.topic.clone(),
        };

        match tokio::time::timeout(self.interval, ctx.transport.call(&remote.node, probe)).await {
            Ok(Ok(Response::TopicStatus { exists: true })) => {
                link.mark_online();
            }
            Ok(Ok(Response::TopicStatus { exists: false })) => {
                link.mark_offline();
                if !ctx.sink.is_master() {
                    debug!("Remote topic {} is gone, leaving the unlink to the master", remote);
                    return;
                }

                info!("Remote topic {} is gone, unlinking {}", remote, topic);
                let mutation = Mutation::Unlink {
                    topic: topic.to_string(),
                    remote: remote.clone(),
                };
                if let Err(e) = ctx.sink.submit(mutation).await {
                    error!("Failed to unlink {} from {}: {}", remote, topic, e);
                }
            }
            Ok(Ok(other)) => {
                debug!("Probe of {} answered {:?}", remote, other);
                link.mark_offline();
            }
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", remote, e);
                link.mark_offline();
            }
            Err(_) => {
                debug!("Probe of {} timed out", remote);
                link.mark_offline();
            }
        }
    }
}
