//! Topics hosted by one broker instance

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_topology::NodeAddr;
use relay_transport::{Event, RecordChange, TopicRecord, Transport};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::sequence::{SequenceSpace, SequenceStore};
use crate::sink::MutationSink;
use crate::stats::StatsSnapshot;
use crate::topic::{Topic, TopicContext};

/// Maps topic names to the live [`Topic`]s of this broker instance.
///
/// The manager is a cache of committed state: topics appear, change and
/// disappear only through [`TopicManager::apply_change`] and
/// [`TopicManager::reconcile`], which the replica coordinator calls after a
/// change is durable.
pub struct TopicManager {
    ctx: TopicContext,
    topics: RwLock<BTreeMap<String, Arc<Topic>>>,
    cancel: CancellationToken,
}

impl TopicManager {
    /// Creates an empty manager.
    ///
    /// Topics assign sequence numbers from `space` and keep their high-water
    /// marks in `sequences`.
    pub fn new(
        local: NodeAddr,
        config: Arc<BrokerConfig>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MutationSink>,
        sequences: Arc<dyn SequenceStore>,
        space: SequenceSpace,
    ) -> Self {
        Self {
            ctx: TopicContext {
                local,
                config,
                transport,
                sink,
                sequences,
                space,
            },
            topics: RwLock::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Address of this broker instance.
    #[must_use]
    pub const fn local(&self) -> &NodeAddr {
        &self.ctx.local
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.ctx.config
    }

    pub(crate) const fn context(&self) -> &TopicContext {
        &self.ctx
    }

    pub(crate) fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Applies one committed change.
    pub fn apply_change(&self, change: RecordChange) {
        let mut topics = self.topics.write();
        match change {
            RecordChange::Put(record) => {
                if let Some(topic) = topics.get(&record.name) {
                    topic.sync(record);
                } else {
                    info!("Instantiating topic {}", record.name);
                    let name = record.name.clone();
                    let topic = Topic::new(self.ctx.clone(), record, &self.cancel);
                    topics.insert(name, topic);
                }
            }
            RecordChange::Delete(name) => {
                if let Some(topic) = topics.remove(&name) {
                    info!("Destroying topic {}", name);
                    topic.close();
                }
            }
        }
    }

    /// Replaces the hosted topics with `records`.
    ///
    /// Topics whose record did not change keep their queues and workers.
    pub fn reconcile(&self, records: Vec<TopicRecord>) {
        let wanted: BTreeMap<String, TopicRecord> = records
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();

        let stale: Vec<String> = self
            .topics
            .read()
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            self.apply_change(RecordChange::Delete(name));
        }

        for record in wanted.into_values() {
            self.apply_change(RecordChange::Put(record));
        }
    }

    /// Whether the topic exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.topics.read().contains_key(name)
    }

    /// Looks up a live topic.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    /// The committed record of a topic.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<TopicRecord> {
        self.topics.read().get(name).map(|topic| topic.record())
    }

    /// Every committed record, ordered by name.
    #[must_use]
    pub fn records(&self) -> Vec<TopicRecord> {
        self.topics.read().values().map(|topic| topic.record()).collect()
    }

    /// Topic names, ordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    /// Publishes an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoSuchTopic`] if the topic does not exist, or
    /// [`BrokerError::Sequence`] if no sequence number could be reserved.
    pub async fn publish(&self, topic: &str, event: Event) -> BrokerResult<u64> {
        let topic = self
            .topic(topic)
            .ok_or_else(|| BrokerError::NoSuchTopic(topic.to_string()))?;
        topic.publish(event).await
    }

    /// Delivery counters of a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub fn stats(&self, topic: &str) -> BrokerResult<StatsSnapshot> {
        self.topic(topic)
            .map(|topic| topic.stats())
            .ok_or_else(|| BrokerError::NoSuchTopic(topic.to_string()))
    }

    /// Stops every topic and waits for their workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let topics: Vec<Arc<Topic>> = std::mem::take(&mut *self.topics.write())
            .into_values()
            .collect();
        for topic in topics {
            topic.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use relay_topology::{EndpointAddr, TopicRef};
    use relay_transport::{
        LinkRecord, Qos, Request, RequestHandler, Response, SubscriptionRecord,
    };
    use relay_transport_memory::MemoryNetwork;

    use crate::testing::{MemorySequences, RecordingSink};

    fn manager() -> TopicManager {
        let network = MemoryNetwork::new();
        TopicManager::new(
            NodeAddr::from("broker-x"),
            Arc::new(BrokerConfig::default()),
            Arc::new(network.transport(NodeAddr::from("broker-x"))),
            Arc::new(RecordingSink::default()),
            Arc::new(MemorySequences::default()),
            SequenceSpace::SINGLE,
        )
    }

    fn subscribed(name: &str, identity: &str) -> TopicRecord {
        let mut record = TopicRecord::new(name);
        record.subscribers.insert(
            identity.to_string(),
            SubscriptionRecord {
                identity: identity.to_string(),
                endpoint: EndpointAddr::from(identity),
                qos: Qos::oneway(),
            },
        );
        record
    }

    #[tokio::test]
    async fn test_apply_put_and_delete() {
        let manager = manager();

        manager.apply_change(RecordChange::Put(TopicRecord::new("b")));
        manager.apply_change(RecordChange::Put(TopicRecord::new("a")));
        assert_eq!(manager.names(), vec!["a".to_string(), "b".to_string()]);

        manager.apply_change(RecordChange::Put(subscribed("a", "sub")));
        assert_eq!(manager.record("a"), Some(subscribed("a", "sub")));

        manager.apply_change(RecordChange::Delete("a".to_string()));
        assert!(!manager.contains("a"));
        assert_matches!(
            manager.publish("a", Event::new("op", "x")).await,
            Err(BrokerError::NoSuchTopic(_))
        );
    }

    #[tokio::test]
    async fn test_reconcile_replaces_state() {
        let manager = manager();
        manager.apply_change(RecordChange::Put(TopicRecord::new("gone")));
        manager.apply_change(RecordChange::Put(subscribed("kept", "sub")));
        let topic = manager.topic("kept").unwrap();
        topic.publish(Event::new("op", "x")).await.unwrap();

        let mut linked = subscribed("kept", "sub");
        let remote = TopicRef::new("broker-y", "kept");
        linked.links.insert(remote.clone(), LinkRecord { remote, cost: 1 });
        manager.reconcile(vec![linked.clone(), TopicRecord::new("new")]);

        assert_eq!(manager.names(), vec!["kept".to_string(), "new".to_string()]);
        assert_eq!(manager.record("kept"), Some(linked));
        // The live topic survives reconciliation, sequence space included.
        assert!(Arc::ptr_eq(&topic, &manager.topic("kept").unwrap()));
        assert_eq!(
            manager.publish("kept", Event::new("op", "y")).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_shutdown_empties_manager() {
        let manager = manager();
        manager.apply_change(RecordChange::Put(subscribed("t", "sub")));

        manager.shutdown().await;

        assert!(manager.names().is_empty());
    }

    /// Serves forwarded publishes from the topics of one manager.
    struct LocalBroker(Arc<TopicManager>);

    #[async_trait]
    impl RequestHandler for LocalBroker {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Publish { topic, event } => match self.0.publish(&topic, event).await {
                    Ok(sequence) => Response::Published { sequence },
                    Err(err) => Response::Error(err.into()),
                },
                _ => Response::Ok,
            }
        }
    }

    fn linked(name: &str, to: &str) -> TopicRecord {
        let mut record = TopicRecord::new(name);
        let remote = TopicRef::new("broker-x", to);
        record
            .links
            .insert(remote.clone(), LinkRecord { remote, cost: 0 });
        record
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_topic_cycle_forwards_once() {
        let network = MemoryNetwork::new();
        let manager = Arc::new(TopicManager::new(
            NodeAddr::from("broker-x"),
            Arc::new(BrokerConfig::default()),
            Arc::new(network.transport(NodeAddr::from("broker-x"))),
            Arc::new(RecordingSink::default()),
            Arc::new(MemorySequences::default()),
            SequenceSpace::SINGLE,
        ));
        network.register(
            NodeAddr::from("broker-x"),
            Arc::new(LocalBroker(Arc::clone(&manager))),
        );

        manager.reconcile(vec![linked("a", "b"), linked("b", "c"), linked("c", "a")]);
        manager.publish("a", Event::new("op", "x")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        for name in ["a", "b", "c"] {
            assert_eq!(manager.stats(name).unwrap().published, 1, "topic {name}");
        }
        assert_eq!(manager.stats("b").unwrap().forwarded, 1);
        assert_eq!(manager.stats("c").unwrap().forwarded, 0);

        network.deregister(&NodeAddr::from("broker-x"));
        manager.shutdown().await;
    }
}
