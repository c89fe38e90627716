//! Replica coordinator: one broker instance inside a replica group

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_broker::{
    BrokerError, LinkMonitor, MutationSink, SequenceSpace, SequenceStore, StatsSnapshot,
    TopicManager,
};
use relay_store::Store;
use relay_topology::{EndpointAddr, Epoch, NodeAddr, ReplicaGroup, TopicRef};
use relay_transport::{
    AdminRequest, CommitId, ErrorKind, Event, LinkRecord, Mutation, Qos, RemoteError,
    ReplicaStatus, Request, RequestHandler, Response, Role, SubscriptionRecord, TopicHandle,
    Transport,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace};

use crate::config::ReplicaConfig;
use crate::durable::DurableState;
use crate::error::ReplicaResult;

/// Volatile election and replication state of a replica.
pub(crate) struct ReplicaState {
    pub(crate) role: Role,
    pub(crate) epoch: Epoch,
    pub(crate) master: Option<NodeAddr>,
    pub(crate) commit: CommitId,
    pub(crate) catching_up: bool,
    pub(crate) fatal: bool,
    pub(crate) last_heard: Instant,
}

pub(crate) struct Inner<S: Store> {
    pub(crate) addr: NodeAddr,
    pub(crate) group: ReplicaGroup,
    pub(crate) index: usize,
    pub(crate) config: Arc<ReplicaConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) durable: DurableState<S>,
    pub(crate) manager: Arc<TopicManager>,
    pub(crate) state: Mutex<ReplicaState>,
    /// Serializes commits, installs and snapshot reads.
    pub(crate) mutations: tokio::sync::Mutex<()>,
    pub(crate) role_changed: Notify,
    /// Followers that missed a change and wait for the next sync.
    pub(crate) behind: Mutex<BTreeSet<NodeAddr>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

/// One replica of a replicated broker.
///
/// The coordinator owns the replica's [`TopicManager`], runs master
/// election against the other members of its [`ReplicaGroup`], and routes
/// every administrative mutation through the master so all replicas commit
/// the same changes in the same order. It is also the [`RequestHandler`]
/// the replica exposes on the network.
pub struct Coordinator<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store> Coordinator<S> {
    /// Creates a replica and restores its topics from `store`.
    ///
    /// The replica serves reads and deliveries from the restored state right
    /// away; it accepts mutations only after [`Coordinator::start`] has found
    /// or elected a master and caught up with it.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, `addr` is not a member of
    /// `group`, or the store cannot be read.
    pub async fn new(
        addr: NodeAddr,
        group: ReplicaGroup,
        config: ReplicaConfig,
        transport: Arc<dyn Transport>,
        store: S,
    ) -> ReplicaResult<Self> {
        config.validate()?;
        let index = group.index_of(&addr)?;
        let durable = DurableState::new(store);
        let recovered = durable.load().await?;

        let config = Arc::new(config);
        let broker_config = Arc::new(config.broker.clone());
        let sequences = Arc::new(CoordinatorSequences {
            durable: durable.clone(),
        });
        let space = SequenceSpace::new(index, group.len());
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let sink = Arc::new(CoordinatorSink {
                inner: weak.clone(),
            });
            let manager = Arc::new(TopicManager::new(
                addr.clone(),
                broker_config,
                transport.clone(),
                sink,
                sequences,
                space,
            ));

            Inner {
                addr,
                group,
                index,
                config,
                transport,
                durable,
                manager,
                state: Mutex::new(ReplicaState {
                    role: Role::Electing,
                    epoch: recovered.epoch,
                    master: None,
                    commit: recovered.commit,
                    catching_up: true,
                    fatal: false,
                    last_heard: Instant::now(),
                }),
                mutations: tokio::sync::Mutex::new(()),
                role_changed: Notify::new(),
                behind: Mutex::new(BTreeSet::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }
        });

        info!(
            "Replica {} restored {} topics at commit {}",
            inner.addr,
            recovered.topics.len(),
            recovered.commit
        );
        inner.manager.reconcile(recovered.topics);

        Ok(Self { inner })
    }

    /// Starts the election loop and the link monitor.
    pub fn start(&self) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(inner.run());

        let monitor = Arc::new(LinkMonitor::new(self.inner.manager.clone()));
        monitor.start_monitoring(&self.inner.tracker, &self.inner.cancel);
    }

    /// Stops the election loop, the link monitor, and every delivery worker.
    pub async fn shutdown(&self) {
        info!("Shutting down replica {}", self.inner.addr);
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.manager.shutdown().await;
    }

    /// Address of this replica.
    #[must_use]
    pub fn addr(&self) -> &NodeAddr {
        &self.inner.addr
    }

    /// The topics hosted by this replica.
    #[must_use]
    pub fn manager(&self) -> &Arc<TopicManager> {
        &self.inner.manager
    }

    /// Current election and replication status.
    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        self.inner.status()
    }

    /// Applies a mutation through the master.
    ///
    /// # Errors
    ///
    /// Returns the user error of a rejected mutation, or a retryable error
    /// when no master can take it right now.
    pub async fn mutate(&self, mutation: Mutation) -> ReplicaResult<()> {
        self.inner.mutate(mutation).await
    }

    /// Creates a topic.
    ///
    /// # Errors
    ///
    /// [`BrokerError::TopicExists`] if the topic exists, or any error of
    /// [`Coordinator::mutate`].
    pub async fn create(&self, name: &str) -> ReplicaResult<TopicHandle> {
        self.mutate(Mutation::CreateTopic {
            name: name.to_string(),
        })
        .await?;
        Ok(self.inner.handle(name))
    }

    /// Destroys a topic together with its subscriptions and links.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub async fn destroy(&self, name: &str) -> ReplicaResult<()> {
        self.mutate(Mutation::DestroyTopic {
            name: name.to_string(),
        })
        .await
    }

    /// Looks up a topic on this replica.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub fn retrieve(&self, name: &str) -> ReplicaResult<TopicHandle> {
        self.inner.retrieve(name)
    }

    /// Topic names known to this replica.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.inner.manager.names()
    }

    /// Subscribes `identity` and returns the handle publishers use.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadySubscribed`] if the identity is subscribed.
    pub async fn subscribe_and_get_publisher(
        &self,
        topic: &str,
        qos: Qos,
        identity: &str,
        endpoint: EndpointAddr,
    ) -> ReplicaResult<TopicHandle> {
        self.mutate(Mutation::Subscribe {
            topic: topic.to_string(),
            subscription: SubscriptionRecord {
                identity: identity.to_string(),
                endpoint,
                qos,
            },
        })
        .await?;
        Ok(self.inner.handle(topic))
    }

    /// Removes a subscription. Succeeds if `identity` is not subscribed.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub async fn unsubscribe(&self, topic: &str, identity: &str) -> ReplicaResult<()> {
        self.mutate(Mutation::Unsubscribe {
            topic: topic.to_string(),
            identity: identity.to_string(),
        })
        .await
    }

    /// Links a topic to a remote topic.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadyLinked`] or [`BrokerError::InvalidLink`].
    pub async fn link(&self, topic: &str, remote: TopicRef, cost: u32) -> ReplicaResult<()> {
        self.mutate(Mutation::Link {
            topic: topic.to_string(),
            link: LinkRecord { remote, cost },
        })
        .await
    }

    /// Removes a link.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchLink`] if the topic is not linked to `remote`.
    pub async fn unlink(&self, topic: &str, remote: TopicRef) -> ReplicaResult<()> {
        self.mutate(Mutation::Unlink {
            topic: topic.to_string(),
            remote,
        })
        .await
    }

    /// Links of a topic.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub fn links(&self, topic: &str) -> ReplicaResult<Vec<LinkRecord>> {
        self.inner.links(topic)
    }

    /// Subscriptions of a topic.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub fn subscribers(&self, topic: &str) -> ReplicaResult<Vec<SubscriptionRecord>> {
        self.inner.subscribers(topic)
    }

    /// Publishes an event on this replica and returns its sequence number.
    ///
    /// The number is above `event.sequence`, which publishers set to the
    /// last number any replica gave them.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist, or
    /// [`BrokerError::Sequence`] if the store refused the sequence mark.
    pub async fn publish(&self, topic: &str, event: Event) -> ReplicaResult<u64> {
        Ok(self.inner.manager.publish(topic, event).await?)
    }

    /// Delivery counters of a topic on this replica.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NoSuchTopic`] if the topic does not exist.
    pub fn stats(&self, topic: &str) -> ReplicaResult<StatsSnapshot> {
        Ok(self.inner.manager.stats(topic)?)
    }
}

impl<S: Store> Inner<S> {
    pub(crate) fn status(&self) -> ReplicaStatus {
        let state = self.state.lock();
        ReplicaStatus {
            addr: self.addr.clone(),
            role: state.role,
            epoch: state.epoch,
            master: state.master.clone(),
            commit: state.commit,
            catching_up: state.catching_up,
            fatal: state.fatal,
        }
    }

    pub(crate) fn peers(&self) -> Vec<NodeAddr> {
        self.group.peers_of(&self.addr).cloned().collect()
    }

    fn handle(&self, name: &str) -> TopicHandle {
        let publish_endpoints = self
            .config
            .replicated_publish_endpoints
            .clone()
            .unwrap_or_else(|| self.group.replicas().to_vec());
        TopicHandle {
            name: name.to_string(),
            publish_endpoints,
        }
    }

    fn retrieve(&self, name: &str) -> ReplicaResult<TopicHandle> {
        if self.manager.contains(name) {
            Ok(self.handle(name))
        } else {
            Err(BrokerError::NoSuchTopic(name.to_string()).into())
        }
    }

    fn links(&self, topic: &str) -> ReplicaResult<Vec<LinkRecord>> {
        let record = self
            .manager
            .record(topic)
            .ok_or_else(|| BrokerError::NoSuchTopic(topic.to_string()))?;
        Ok(record.links.into_values().collect())
    }

    fn subscribers(&self, topic: &str) -> ReplicaResult<Vec<SubscriptionRecord>> {
        let record = self
            .manager
            .record(topic)
            .ok_or_else(|| BrokerError::NoSuchTopic(topic.to_string()))?;
        Ok(record.subscribers.into_values().collect())
    }

    async fn admin(&self, request: AdminRequest) -> ReplicaResult<Response> {
        match request {
            AdminRequest::Mutate(mutation) => {
                let created = match &mutation {
                    Mutation::CreateTopic { name } => Some(name.clone()),
                    Mutation::Subscribe { topic, .. } => Some(topic.clone()),
                    _ => None,
                };
                self.mutate(mutation).await?;
                Ok(created.map_or(Response::Ok, |name| Response::Handle(self.handle(&name))))
            }
            AdminRequest::Retrieve { name } => self.retrieve(&name).map(Response::Handle),
            AdminRequest::List => Ok(Response::Topics(self.manager.names())),
            AdminRequest::Links { topic } => self.links(&topic).map(Response::Links),
            AdminRequest::Subscribers { topic } => {
                self.subscribers(&topic).map(Response::Subscribers)
            }
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        trace!("Replica {} handling {}", self.addr, request.name());

        match request {
            Request::Publish { topic, event } => match self.manager.publish(&topic, event).await {
                Ok(sequence) => Response::Published { sequence },
                Err(e) => Response::Error(e.into()),
            },
            Request::Probe { topic } => Response::TopicStatus {
                exists: self.manager.contains(&topic),
            },
            Request::Status | Request::Candidacy { .. } => Response::Status(self.status()),
            Request::Elected {
                master,
                epoch,
                commit,
            }
            | Request::Heartbeat {
                master,
                epoch,
                commit,
            } => self.on_master_message(&master, epoch, commit),
            Request::Forward { mutation } => self.on_forward(mutation).await,
            Request::Replicate {
                master,
                epoch,
                previous,
                commit,
                change,
            } => {
                self.on_replicate(&master, epoch, previous, commit, change)
                    .await
            }
            Request::InstallSnapshot {
                master,
                epoch,
                snapshot,
            } => self.on_install(&master, epoch, snapshot).await,
            Request::FetchSnapshot => Response::Snapshot(self.snapshot().await),
            Request::Admin(request) => match self.admin(request).await {
                Ok(response) => response,
                Err(e) => Response::Error(e.into()),
            },
        }
    }
}

#[async_trait]
impl<S: Store> RequestHandler for Coordinator<S> {
    async fn handle(&self, request: Request) -> Response {
        self.inner.handle_request(request).await
    }
}

/// Routes mutations raised by the data plane through the coordinator.
struct CoordinatorSink<S: Store> {
    inner: Weak<Inner<S>>,
}

#[async_trait]
impl<S: Store> MutationSink for CoordinatorSink<S> {
    async fn submit(&self, mutation: Mutation) -> Result<(), RemoteError> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(RemoteError::new(ErrorKind::Internal, "replica stopped"));
        };
        inner.mutate(mutation).await.map_err(Into::into)
    }

    fn is_master(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            let state = inner.state.lock();
            state.role == Role::Master && !state.catching_up
        })
    }
}

/// Keeps the sequence marks of this replica's topics in its store.
struct CoordinatorSequences<S: Store> {
    durable: DurableState<S>,
}

#[async_trait]
impl<S: Store> SequenceStore for CoordinatorSequences<S> {
    async fn high_water(&self, topic: &str) -> Result<u64, RemoteError> {
        self.durable
            .sequence_mark(topic)
            .await
            .map_err(RemoteError::from)
    }

    async fn reserve(&self, topic: &str, mark: u64) -> Result<(), RemoteError> {
        self.durable
            .save_sequence_mark(topic, mark)
            .await
            .map_err(RemoteError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    use crate::error::ReplicaError;
    use relay_store_memory::MemoryStore;
    use relay_transport_memory::MemoryNetwork;
    use std::time::Duration;

    async fn single(network: &MemoryNetwork, store: MemoryStore) -> Coordinator<MemoryStore> {
        let addr = NodeAddr::from("broker-x");
        let coordinator = Coordinator::new(
            addr.clone(),
            ReplicaGroup::single(addr.clone()),
            ReplicaConfig::default(),
            Arc::new(network.transport(addr.clone())),
            store,
        )
        .await
        .unwrap();
        network.register(addr, Arc::new(coordinator.clone()));
        coordinator
    }

    async fn wait_for_master(coordinator: &Coordinator<MemoryStore>) {
        let elected = async {
            while coordinator.status().role != Role::Master {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), elected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_wait_for_catch_up() {
        let network = MemoryNetwork::new();
        let coordinator = single(&network, MemoryStore::new()).await;

        assert_matches!(coordinator.create("fed1").await, Err(ReplicaError::CatchingUp));
        let status = coordinator.status();
        assert_eq!(status.role, Role::Electing);
        assert!(status.catching_up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_replica_elects_itself_and_restores() {
        let network = MemoryNetwork::new();
        let store = MemoryStore::new();
        let coordinator = single(&network, store.clone()).await;
        coordinator.start();
        wait_for_master(&coordinator).await;

        let handle = coordinator.create("fed1").await.unwrap();
        assert_eq!(handle.publish_endpoints, vec![NodeAddr::from("broker-x")]);
        coordinator
            .subscribe_and_get_publisher("fed1", Qos::twoway(), "sub", EndpointAddr::from("c1"))
            .await
            .unwrap();
        let epoch = coordinator.status().epoch;
        assert_eq!(coordinator.status().commit, CommitId::new(epoch, 2));
        coordinator.shutdown().await;
        network.deregister(&NodeAddr::from("broker-x"));

        let restarted = single(&network, store).await;
        assert_eq!(restarted.list(), vec!["fed1".to_string()]);
        assert_eq!(restarted.subscribers("fed1").unwrap()[0].identity, "sub");
        restarted.start();
        wait_for_master(&restarted).await;
        assert!(restarted.status().epoch > epoch);
        restarted.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_serves_admin_and_data_requests() {
        let network = MemoryNetwork::new();
        let coordinator = single(&network, MemoryStore::new()).await;
        coordinator.start();
        wait_for_master(&coordinator).await;

        let response = coordinator
            .handle(Request::Admin(AdminRequest::Mutate(Mutation::CreateTopic {
                name: "fed1".to_string(),
            })))
            .await;
        assert_matches!(response, Response::Handle(handle) if handle.name == "fed1");

        assert_eq!(
            coordinator
                .handle(Request::Probe {
                    topic: "fed1".to_string()
                })
                .await,
            Response::TopicStatus { exists: true }
        );
        assert_eq!(
            coordinator
                .handle(Request::Publish {
                    topic: "fed1".to_string(),
                    event: Event::new("op", "x"),
                })
                .await,
            Response::Published { sequence: 1 }
        );
        assert_eq!(coordinator.stats("fed1").unwrap().published, 1);
        assert_matches!(
            coordinator
                .handle(Request::Publish {
                    topic: "missing".to_string(),
                    event: Event::new("op", "x"),
                })
                .await,
            Response::Error(e) if e.kind == ErrorKind::NoSuchTopic
        );
        assert_eq!(
            coordinator.handle(Request::Admin(AdminRequest::List)).await,
            Response::Topics(vec!["fed1".to_string()])
        );
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_master_messages_rejected() {
        let network = MemoryNetwork::new();
        let coordinator = single(&network, MemoryStore::new()).await;
        coordinator.start();
        wait_for_master(&coordinator).await;
        let epoch = coordinator.status().epoch;

        let response = coordinator
            .handle(Request::Heartbeat {
                master: NodeAddr::from("broker-z"),
                epoch,
                commit: CommitId::default(),
            })
            .await;

        assert_matches!(response, Response::Error(e) if e.kind == ErrorKind::StaleEpoch);
        assert_eq!(coordinator.status().role, Role::Master);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_grow_across_restarts() {
        let network = MemoryNetwork::new();
        let store = MemoryStore::new();
        let coordinator = single(&network, store.clone()).await;
        coordinator.start();
        wait_for_master(&coordinator).await;
        coordinator.create("fed1").await.unwrap();

        let before = coordinator.publish("fed1", Event::new("op", "a")).await.unwrap();
        coordinator.shutdown().await;
        network.deregister(&NodeAddr::from("broker-x"));

        let restarted = single(&network, store).await;
        let after = restarted.publish("fed1", Event::new("op", "b")).await.unwrap();
        assert!(after > before, "{after} after {before}");
        restarted.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_must_own_its_epoch() {
        let network = MemoryNetwork::new();
        let addr = NodeAddr::from("broker-x");
        let coordinator = Coordinator::new(
            addr.clone(),
            ReplicaGroup::new(["broker-x", "broker-y"]).unwrap(),
            ReplicaConfig::default(),
            Arc::new(network.transport(addr)),
            MemoryStore::new(),
        )
        .await
        .unwrap();
        let heartbeat = |master: &str, epoch: u64| Request::Heartbeat {
            master: NodeAddr::from(master),
            epoch: Epoch::new(epoch),
            commit: CommitId::default(),
        };

        // Even epochs are ballots of broker-x.
        assert_matches!(
            coordinator.handle(heartbeat("broker-y", 2)).await,
            Response::Error(e) if e.kind == ErrorKind::ForeignEpoch
        );
        assert_matches!(
            coordinator.handle(heartbeat("broker-z", 3)).await,
            Response::Error(e) if e.kind == ErrorKind::ForeignEpoch
        );
        assert_eq!(coordinator.status().role, Role::Electing);

        assert_eq!(coordinator.handle(heartbeat("broker-y", 3)).await, Response::Ok);
        let status = coordinator.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.master, Some(NodeAddr::from("broker-y")));
        assert_eq!(status.epoch, Epoch::new(3));
    }
}
