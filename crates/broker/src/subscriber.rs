use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relay_transport::{Event, Mutation, SubscriptionRecord, Transport};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::OverflowPolicy;
use crate::delivery::{DeliveryOutcome, DeliveryStrategy, DeliveryTarget, strategy_for};
use crate::queue::EventQueue;
use crate::sink::MutationSink;
use crate::stats::TopicStats;
use crate::topic::TopicContext;

/// A live subscription: its queue and the worker draining it.
pub(crate) struct Subscription {
    topic: String,
    record: SubscriptionRecord,
    policy: OverflowPolicy,
    queue: EventQueue,
    evicted: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<TopicStats>,
    sink: Arc<dyn MutationSink>,
}

impl Subscription {
    /// Creates the subscription and spawns its delivery worker on `tracker`.
    pub(crate) fn start(
        ctx: &TopicContext,
        topic: &str,
        record: SubscriptionRecord,
        parent: &CancellationToken,
        tracker: &TaskTracker,
        stats: Arc<TopicStats>,
    ) -> Arc<Self> {
        let strategy = strategy_for(record.qos, &ctx.config);
        let subscription = Arc::new(Self {
            topic: topic.to_string(),
            policy: ctx.config.topic.queue_size_max_policy,
            queue: EventQueue::new(ctx.config.topic.queue_size_max),
            evicted: AtomicBool::new(false),
            cancel: parent.child_token(),
            tracker: tracker.clone(),
            stats,
            sink: Arc::clone(&ctx.sink),
            record,
        });

        debug!(
            "Starting {} delivery worker for {} on {}",
            subscription.record.qos.mode, subscription.record.identity, topic
        );

        let worker = Arc::clone(&subscription);
        let transport = Arc::clone(&ctx.transport);
        tracker.spawn(async move { worker.run(strategy, transport).await });

        subscription
    }

    pub(crate) const fn record(&self) -> &SubscriptionRecord {
        &self.record
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Queues an event, applying the overflow policy when the queue is full.
    pub(crate) fn offer(self: &Arc<Self>, event: Event) {
        if self.is_evicted() {
            return;
        }

        if self.queue.push(event).is_err() {
            match self.policy {
                OverflowPolicy::DropEvents => {
                    self.stats.record_dropped(1);
                    debug!(
                        "Queue of {} on {} is full, dropping event",
                        self.record.identity, self.topic
                    );
                }
                OverflowPolicy::RemoveSubscriber => {
                    self.stats.record_dropped(1);
                    self.evict("queue full");
                }
            }
        }
    }

    /// Stops the worker. An in-flight delivery may still reach the endpoint;
    /// its outcome is ignored.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Detaches the subscription locally and submits its removal.
    ///
    /// The worker stays up but idle while the removal is pending. If the
    /// removal cannot be committed the subscription resumes deliveries, and
    /// the next overflow or failure tries again.
    fn evict(self: &Arc<Self>, reason: &str) {
        if self.evicted.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stats.record_dropped(self.queue.clear());
        self.stats.record_removed_subscriber();

        warn!(
            "Removing subscriber {} from {}: {}",
            self.record.identity, self.topic, reason
        );

        let subscription = Arc::clone(self);
        let mutation = Mutation::Unsubscribe {
            topic: self.topic.clone(),
            identity: self.record.identity.clone(),
        };
        self.tracker.spawn(async move {
            let result = tokio::select! {
                () = subscription.cancel.cancelled() => return,
                result = subscription.sink.submit(mutation.clone()) => result,
            };
            if let Err(e) = result {
                error!("Failed to submit {}: {}", mutation, e);
                subscription.rearm();
            }
        });
    }

    fn rearm(&self) {
        if self.cancel.is_cancelled() || !self.evicted.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            "Resuming deliveries to {} on {}",
            self.record.identity, self.topic
        );
    }

    async fn run(self: Arc<Self>, strategy: Box<dyn DeliveryStrategy>, transport: Arc<dyn Transport>) {
        let target = DeliveryTarget {
            transport: transport.as_ref(),
            endpoint: &self.record.endpoint,
            cancel: &self.cancel,
        };

        while let Some(events) = self
            .queue
            .next_batch(strategy.batch_size(), strategy.linger(), &self.cancel)
            .await
        {
            if self.is_evicted() {
                self.stats.record_dropped(events.len());
                continue;
            }

            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                outcome = strategy.deliver(&target, events) => outcome,
            };

            match outcome {
                DeliveryOutcome::Delivered(count) => self.stats.record_delivered(count),
                DeliveryOutcome::Dropped(count) => self.stats.record_dropped(count),
                DeliveryOutcome::Failed(count) => {
                    self.stats.record_dropped(count);
                    if strategy.evicts_on_failure()
                        || self.policy == OverflowPolicy::RemoveSubscriber
                    {
                        self.evict("delivery failed");
                    }
                }
            }
        }

        debug!(
            "Delivery worker for {} on {} stopped",
            self.record.identity, self.topic
        );
    }
}
