//! One topic's fan-out

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_topology::{NodeAddr, TopicRef};
use relay_transport::{Event, TopicRecord, Transport};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::link::Link;
use crate::sequence::{SequenceSpace, SequenceStore, Sequencer};
use crate::sink::MutationSink;
use crate::stats::{StatsSnapshot, TopicStats};
use crate::subscriber::Subscription;

/// Collaborators shared by every topic of a broker instance.
#[derive(Clone)]
pub struct TopicContext {
    /// Address of this broker instance.
    pub local: NodeAddr,
    /// Broker configuration.
    pub config: Arc<BrokerConfig>,
    /// Transport for deliveries and forwarding.
    pub transport: Arc<dyn Transport>,
    /// Where evictions and link removals are submitted.
    pub sink: Arc<dyn MutationSink>,
    /// High-water marks of assigned sequence numbers.
    pub sequences: Arc<dyn SequenceStore>,
    /// The sequence numbers this instance assigns.
    pub space: SequenceSpace,
}

/// A topic hosted by this broker instance.
///
/// The subscriber and link maps are immutable snapshots swapped in whole by
/// [`Topic::sync`]; publishing iterates whichever snapshot it loaded, so a
/// concurrent change never disturbs a fan-out in progress.
pub struct Topic {
    name: String,
    ctx: TopicContext,
    record: ArcSwap<TopicRecord>,
    subscribers: ArcSwap<BTreeMap<String, Arc<Subscription>>>,
    links: ArcSwap<BTreeMap<TopicRef, Arc<Link>>>,
    writer: Mutex<()>,
    sequencer: Sequencer,
    stats: Arc<TopicStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Topic {
    pub(crate) fn new(
        ctx: TopicContext,
        record: TopicRecord,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let sequencer = Sequencer::new(&record.name, ctx.space, Arc::clone(&ctx.sequences));
        let topic = Arc::new(Self {
            name: record.name.clone(),
            ctx,
            record: ArcSwap::from_pointee(TopicRecord::new(record.name.clone())),
            subscribers: ArcSwap::from_pointee(BTreeMap::new()),
            links: ArcSwap::from_pointee(BTreeMap::new()),
            writer: Mutex::new(()),
            sequencer,
            stats: Arc::new(TopicStats::default()),
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
        });
        topic.sync(record);
        topic
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The committed record this topic currently reflects.
    #[must_use]
    pub fn record(&self) -> TopicRecord {
        self.record.load().as_ref().clone()
    }

    /// Fans `event` out to every subscription and outbound link.
    ///
    /// Events published here get the next sequence number of this topic,
    /// above the number the publisher last saw (`event.sequence`). Events
    /// forwarded from a linked topic keep the number assigned where they were
    /// first published. Returns the event's sequence number.
    ///
    /// # Errors
    ///
    /// Fails when no sequence number can be reserved; the event is not
    /// delivered then.
    pub async fn publish(&self, mut event: Event) -> BrokerResult<u64> {
        if event.origin.is_some() {
            self.fan_out(&event);
            return Ok(event.sequence);
        }

        let floor = event.sequence;
        event.cost = 0;
        event.route.clear();
        self.sequencer
            .assign(floor, |sequence| {
                event.sequence = sequence;
                self.fan_out(&event);
            })
            .await
    }

    fn fan_out(&self, event: &Event) {
        self.stats.record_published();

        for subscription in self.subscribers.load().values() {
            subscription.offer(event.clone());
        }

        for link in self.links.load().values() {
            link.offer(event);
        }
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Events waiting in a subscription's queue, if it is live.
    #[must_use]
    pub fn queue_len(&self, identity: &str) -> Option<usize> {
        self.subscribers
            .load()
            .get(identity)
            .filter(|s| !s.is_evicted())
            .map(|s| s.queue_len())
    }

    /// Whether a subscription is live and delivering on this instance.
    #[must_use]
    pub fn is_delivering(&self, identity: &str) -> bool {
        self.subscribers
            .load()
            .get(identity)
            .is_some_and(|s| !s.is_evicted())
    }

    /// Whether forwarding over the link to `remote` is active.
    #[must_use]
    pub fn is_link_online(&self, remote: &TopicRef) -> Option<bool> {
        self.links.load().get(remote).map(|link| link.is_online())
    }

    pub(crate) fn links(&self) -> Vec<Arc<Link>> {
        self.links.load().values().cloned().collect()
    }

    /// Brings the live subscriptions and links in line with `record`.
    ///
    /// Entries whose record is unchanged keep their queue and worker.
    pub(crate) fn sync(&self, record: TopicRecord) {
        let _writer = self.writer.lock();

        let current = self.subscribers.load_full();
        let mut subscribers = BTreeMap::new();
        for (identity, wanted) in &record.subscribers {
            let subscription = match current.get(identity) {
                Some(existing) if existing.record() == wanted && !existing.is_evicted() => {
                    Arc::clone(existing)
                }
                existing => {
                    if let Some(old) = existing {
                        old.stop();
                    }
                    Subscription::start(
                        &self.ctx,
                        &self.name,
                        wanted.clone(),
                        &self.cancel,
                        &self.tracker,
                        Arc::clone(&self.stats),
                    )
                }
            };
            subscribers.insert(identity.clone(), subscription);
        }
        for (identity, old) in current.iter() {
            if !record.subscribers.contains_key(identity) {
                debug!("Stopping subscription {} on {}", identity, self.name);
                old.stop();
            }
        }

        let current = self.links.load_full();
        let mut links = BTreeMap::new();
        for (remote, wanted) in &record.links {
            let link = match current.get(remote) {
                Some(existing) if existing.record() == wanted => Arc::clone(existing),
                existing => {
                    if let Some(old) = existing {
                        old.stop();
                    }
                    Link::start(
                        &self.ctx,
                        TopicRef::new(self.ctx.local.clone(), self.name.clone()),
                        wanted.clone(),
                        &self.cancel,
                        &self.tracker,
                        Arc::clone(&self.stats),
                    )
                }
            };
            links.insert(remote.clone(), link);
        }
        for (remote, old) in current.iter() {
            if !record.links.contains_key(remote) {
                debug!("Stopping link {} -> {}", self.name, old.remote());
                old.stop();
            }
        }

        self.subscribers.store(Arc::new(subscribers));
        self.links.store(Arc::new(links));
        self.record.store(Arc::new(record));
    }

    /// Cancels every worker of this topic without waiting for them.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Cancels every worker and waits until they have stopped.
    pub async fn shutdown(&self) {
        self.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relay_topology::EndpointAddr;
    use relay_transport::{LinkRecord, Mutation, Qos, SubscriptionRecord};
    use relay_transport_memory::{MemoryNetwork, RecordingEndpoint};

    use crate::config::OverflowPolicy;
    use crate::testing::{MemorySequences, RecordingSink};

    struct Fixture {
        network: MemoryNetwork,
        sink: Arc<RecordingSink>,
        ctx: TopicContext,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(queue_size_max: usize, policy: OverflowPolicy) -> Self {
            let network = MemoryNetwork::new();
            let sink = Arc::new(RecordingSink::default());
            let mut config = BrokerConfig::default();
            config.topic.queue_size_max = queue_size_max;
            config.topic.queue_size_max_policy = policy;
            config.send.retry_count = 0;

            let ctx = TopicContext {
                local: NodeAddr::from("broker-x"),
                config: Arc::new(config),
                transport: Arc::new(network.transport(NodeAddr::from("broker-x"))),
                sink: sink.clone(),
                sequences: Arc::new(MemorySequences::default()),
                space: SequenceSpace::SINGLE,
            };
            Self {
                network,
                sink,
                ctx,
                cancel: CancellationToken::new(),
            }
        }

        fn endpoint(&self, name: &str) -> RecordingEndpoint {
            let endpoint = RecordingEndpoint::new();
            self.network
                .register_endpoint(EndpointAddr::from(name), Arc::new(endpoint.clone()));
            endpoint
        }

        fn topic(&self, record: TopicRecord) -> Arc<Topic> {
            Topic::new(self.ctx.clone(), record, &self.cancel)
        }
    }

    fn with_subscriber(name: &str, identity: &str, qos: Qos) -> TopicRecord {
        let mut record = TopicRecord::new(name);
        record.subscribers.insert(
            identity.to_string(),
            SubscriptionRecord {
                identity: identity.to_string(),
                endpoint: EndpointAddr::from(identity),
                qos,
            },
        );
        record
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let fixture = Fixture::new(100, OverflowPolicy::DropEvents);
        let topic = fixture.topic(TopicRecord::new("t"));

        let first = topic.publish(Event::new("op", "a")).await.unwrap();
        let second = topic.publish(Event::new("op", "b")).await.unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(topic.stats().published, 2);
    }

    #[tokio::test]
    async fn test_ordered_subscriber_receives_in_order() {
        let fixture = Fixture::new(1000, OverflowPolicy::DropEvents);
        let endpoint = fixture.endpoint("sub");
        let topic = fixture.topic(with_subscriber("t", "sub", Qos::ordered()));

        for i in 0..200 {
            topic.publish(Event::new("op", format!("event-{i}"))).await.unwrap();
        }

        assert!(endpoint.wait_for(200, Duration::from_secs(5)).await);
        assert_eq!(endpoint.sequences(), (1..=200).collect::<Vec<u64>>());
        assert_eq!(topic.stats().delivered, 200);
    }

    #[tokio::test]
    async fn test_drop_events_keeps_queue_bounded() {
        for (queue_size_max, published) in [(4usize, 10usize), (40, 100), (400, 2000)] {
            let fixture = Fixture::new(queue_size_max, OverflowPolicy::DropEvents);
            let endpoint = fixture.endpoint("slow");
            endpoint.set_stalled(true);
            let topic = fixture.topic(with_subscriber("t", "slow", Qos::twoway()));

            for _ in 0..published {
                topic.publish(Event::new("op", "x")).await.unwrap();
                assert!(topic.queue_len("slow").unwrap() <= queue_size_max);
            }
            // Let the worker pick its first event, then refill.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            topic.publish(Event::new("op", "x")).await.unwrap();

            assert_eq!(topic.queue_len("slow"), Some(queue_size_max));
            assert!(topic.is_delivering("slow"));

            endpoint.set_stalled(false);
            let stats = topic.stats();
            let expected = usize::try_from(stats.published - stats.dropped).unwrap();
            assert!(endpoint.wait_for(expected, Duration::from_secs(5)).await);
            assert!(endpoint.len() <= queue_size_max + 1);
            assert!(fixture.sink.mutations().is_empty());
        }
    }

    #[tokio::test]
    async fn test_remove_subscriber_on_overflow() {
        for queue_size_max in [3usize, 30, 300] {
            let fixture = Fixture::new(queue_size_max, OverflowPolicy::RemoveSubscriber);
            let endpoint = fixture.endpoint("slow");
            endpoint.set_stalled(true);
            let topic = fixture.topic(with_subscriber("t", "slow", Qos::twoway()));

            for _ in 0..=queue_size_max + 1 {
                topic.publish(Event::new("op", "x")).await.unwrap();
            }

            assert!(!topic.is_delivering("slow"));
            assert_eq!(topic.stats().removed_subscribers, 1);

            let mutations = fixture.sink.wait_for(1).await;
            assert_eq!(
                mutations,
                vec![Mutation::Unsubscribe {
                    topic: "t".to_string(),
                    identity: "slow".to_string(),
                }]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_failure_evicts_regardless_of_policy() {
        let fixture = Fixture::new(10, OverflowPolicy::DropEvents);
        let endpoint = fixture.endpoint("sub");
        endpoint.set_failing(true);
        let topic = fixture.topic(with_subscriber("t", "sub", Qos::ordered()));

        topic.publish(Event::new("op", "x")).await.unwrap();

        let mutations = fixture.sink.wait_for(1).await;
        assert_matches::assert_matches!(
            &mutations[..],
            [Mutation::Unsubscribe { identity, .. }] if identity == "sub"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_twoway_failure_drops_under_drop_events() {
        let fixture = Fixture::new(10, OverflowPolicy::DropEvents);
        let endpoint = fixture.endpoint("sub");
        endpoint.set_failing(true);
        let topic = fixture.topic(with_subscriber("t", "sub", Qos::twoway()));

        topic.publish(Event::new("op", "lost")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        endpoint.set_failing(false);
        topic.publish(Event::new("op", "kept")).await.unwrap();
        assert!(endpoint.wait_for(1, Duration::from_secs(1)).await);

        assert_eq!(endpoint.sequences(), vec![2]);
        assert!(topic.is_delivering("sub"));
        assert_eq!(topic.stats().dropped, 1);
        assert!(fixture.sink.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_on_size_and_timer() {
        let network = MemoryNetwork::new();
        let endpoint = RecordingEndpoint::new();
        network.register_endpoint(EndpointAddr::from("batch"), Arc::new(endpoint.clone()));
        let mut config = BrokerConfig::default();
        config.flush.batch_size_max = 5;
        config.flush.timeout = Duration::from_millis(500);
        let ctx = TopicContext {
            local: NodeAddr::from("broker-x"),
            config: Arc::new(config),
            transport: Arc::new(network.transport(NodeAddr::from("broker-x"))),
            sink: Arc::new(RecordingSink::default()),
            sequences: Arc::new(MemorySequences::default()),
            space: SequenceSpace::SINGLE,
        };
        let topic = Topic::new(
            ctx,
            with_subscriber("t", "batch", Qos::new(relay_transport::QosMode::BatchTwoway)),
            &CancellationToken::new(),
        );

        for _ in 0..7 {
            topic.publish(Event::new("op", "x")).await.unwrap();
        }

        assert!(endpoint.wait_for(5, Duration::from_millis(100)).await);
        assert_eq!(endpoint.len(), 5);

        assert!(endpoint.wait_for(7, Duration::from_secs(1)).await);
        assert_eq!(endpoint.sequences(), (1..=7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_sync_keeps_unchanged_subscription() {
        let fixture = Fixture::new(100, OverflowPolicy::DropEvents);
        let endpoint = fixture.endpoint("sub");
        endpoint.set_stalled(true);
        let record = with_subscriber("t", "sub", Qos::twoway());
        let topic = fixture.topic(record.clone());

        topic.publish(Event::new("op", "a")).await.unwrap();
        topic.publish(Event::new("op", "b")).await.unwrap();
        tokio::task::yield_now().await;
        let queued = topic.queue_len("sub");

        let mut linked = record;
        let remote = TopicRef::new("broker-y", "t");
        linked.links.insert(remote.clone(), LinkRecord { remote, cost: 0 });
        topic.sync(linked.clone());

        assert_eq!(topic.queue_len("sub"), queued);
        assert_eq!(topic.record(), linked);

        topic.sync(TopicRecord::new("t"));
        assert_eq!(topic.queue_len("sub"), None);
        assert!(topic.links().is_empty());
    }

    #[tokio::test]
    async fn test_link_loop_and_cost_rules() {
        let fixture = Fixture::new(100, OverflowPolicy::DropEvents);
        let mut record = TopicRecord::new("t");
        let back = TopicRef::new("broker-y", "t");
        let costly = TopicRef::new("broker-z", "t");
        record.links.insert(
            back.clone(),
            LinkRecord {
                remote: back.clone(),
                cost: 0,
            },
        );
        record.links.insert(
            costly.clone(),
            LinkRecord {
                remote: costly.clone(),
                cost: 2,
            },
        );
        let topic = fixture.topic(record);
        let links = topic.links();
        let link_to = |remote: &TopicRef| {
            links
                .iter()
                .find(|l| l.remote() == remote)
                .cloned()
                .unwrap()
        };

        let mut from_y = Event::new("op", "x");
        from_y.origin = Some(back.clone());
        from_y.cost = 1;
        assert!(!link_to(&back).carries(&from_y));
        assert!(link_to(&costly).carries(&from_y));

        from_y.cost = 3;
        assert!(!link_to(&costly).carries(&from_y));

        let local = Event::new("op", "x");
        assert!(link_to(&back).carries(&local));
        assert!(link_to(&costly).carries(&local));

        topic.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_stays_above_publisher_floor() {
        let fixture = Fixture::new(100, OverflowPolicy::DropEvents);
        let topic = fixture.topic(TopicRecord::new("t"));

        let mut seen = Event::new("op", "a");
        seen.sequence = 40;
        assert_eq!(topic.publish(seen).await.unwrap(), 41);
        assert_eq!(topic.publish(Event::new("op", "b")).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_eviction_resumes_deliveries() {
        let fixture = Fixture::new(3, OverflowPolicy::RemoveSubscriber);
        fixture.sink.set_refusing(true);
        let endpoint = fixture.endpoint("slow");
        endpoint.set_stalled(true);
        let topic = fixture.topic(with_subscriber("t", "slow", Qos::twoway()));

        for _ in 0..=4 {
            topic.publish(Event::new("op", "x")).await.unwrap();
        }
        assert!(!topic.is_delivering("slow"));
        fixture.sink.wait_for(1).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Nobody took the removal, so this replica keeps delivering.
        assert!(topic.is_delivering("slow"));
        endpoint.set_stalled(false);
        let sequence = topic.publish(Event::new("op", "after")).await.unwrap();
        assert!(endpoint.wait_for(1, Duration::from_secs(5)).await);
        assert_eq!(endpoint.sequences(), vec![sequence]);
        assert_eq!(topic.stats().removed_subscribers, 1);
    }

    #[tokio::test]
    async fn test_sync_replaces_evicted_subscription() {
        let fixture = Fixture::new(2, OverflowPolicy::RemoveSubscriber);
        let endpoint = fixture.endpoint("slow");
        endpoint.set_stalled(true);
        let record = with_subscriber("t", "slow", Qos::twoway());
        let topic = fixture.topic(record.clone());

        for _ in 0..4 {
            topic.publish(Event::new("op", "x")).await.unwrap();
        }
        assert!(!topic.is_delivering("slow"));

        // An unrelated change arrives before the removal does.
        let mut linked = record;
        let remote = TopicRef::new("broker-y", "t");
        linked.links.insert(remote.clone(), LinkRecord { remote, cost: 0 });
        topic.sync(linked);

        assert!(topic.is_delivering("slow"));
        assert_eq!(topic.queue_len("slow"), Some(0));
        topic.shutdown().await;
    }
}
