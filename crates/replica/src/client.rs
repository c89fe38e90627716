//! Remote administration of a replica group

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_topology::{EndpointAddr, NodeAddr, ReplicaGroup, TopicRef};
use relay_transport::{
    AdminRequest, LinkRecord, Mutation, Qos, Request, Response, SubscriptionRecord, TopicHandle,
    Transport, TransportError,
};
use tracing::debug;

use crate::error::{ReplicaError, ReplicaResult};
use crate::publisher::Publisher;

/// Administrative client for a replicated broker.
///
/// Calls go to the replica that last answered, then to the other replicas
/// in group order. Retryable failures move on to the next replica; a
/// `NotMaster` answer naming the master moves it to the front.
pub struct AdminClient {
    transport: Arc<dyn Transport>,
    replicas: Vec<NodeAddr>,
    preferred: Mutex<Option<NodeAddr>>,
    timeout: Duration,
}

impl AdminClient {
    /// Creates a client for the replicas of `group`.
    pub fn new(transport: Arc<dyn Transport>, group: &ReplicaGroup) -> Self {
        Self {
            transport,
            replicas: group.replicas().to_vec(),
            preferred: Mutex::new(None),
            timeout: Duration::from_secs(5),
        }
    }

    /// Bounds each call to one replica.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Creates a topic.
    ///
    /// # Errors
    ///
    /// `TopicExists`, or the last retryable error once every replica failed.
    pub async fn create(&self, name: &str) -> ReplicaResult<TopicHandle> {
        let mutation = Mutation::CreateTopic {
            name: name.to_string(),
        };
        match self.call(AdminRequest::Mutate(mutation)).await? {
            Response::Handle(handle) => Ok(handle),
            _ => Err(ReplicaError::UnexpectedResponse("create")),
        }
    }

    /// Destroys a topic.
    ///
    /// # Errors
    ///
    /// `NoSuchTopic`, or the last retryable error once every replica failed.
    pub async fn destroy(&self, name: &str) -> ReplicaResult<()> {
        self.mutate(Mutation::DestroyTopic {
            name: name.to_string(),
        })
        .await
    }

    /// Looks up a topic.
    ///
    /// # Errors
    ///
    /// `NoSuchTopic`, or the last retryable error once every replica failed.
    pub async fn retrieve(&self, name: &str) -> ReplicaResult<TopicHandle> {
        let request = AdminRequest::Retrieve {
            name: name.to_string(),
        };
        match self.call(request).await? {
            Response::Handle(handle) => Ok(handle),
            _ => Err(ReplicaError::UnexpectedResponse("retrieve")),
        }
    }

    /// Lists topic names.
    ///
    /// # Errors
    ///
    /// The last retryable error once every replica failed.
    pub async fn list(&self) -> ReplicaResult<Vec<String>> {
        match self.call(AdminRequest::List).await? {
            Response::Topics(names) => Ok(names),
            _ => Err(ReplicaError::UnexpectedResponse("list")),
        }
    }

    /// Subscribes `identity` to a topic.
    ///
    /// # Errors
    ///
    /// `AlreadySubscribed`, `NoSuchTopic`, or the last retryable error.
    pub async fn subscribe_and_get_publisher(
        &self,
        topic: &str,
        qos: Qos,
        identity: &str,
        endpoint: EndpointAddr,
    ) -> ReplicaResult<TopicHandle> {
        let mutation = Mutation::Subscribe {
            topic: topic.to_string(),
            subscription: SubscriptionRecord {
                identity: identity.to_string(),
                endpoint,
                qos,
            },
        };
        match self.call(AdminRequest::Mutate(mutation)).await? {
            Response::Handle(handle) => Ok(handle),
            _ => Err(ReplicaError::UnexpectedResponse("subscribe")),
        }
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// `NoSuchTopic`, or the last retryable error once every replica failed.
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
    /// `AlreadyLinked`, `InvalidLink`, or the last retryable error.
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
    /// `NoSuchLink`, or the last retryable error once every replica failed.
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
    /// `NoSuchTopic`, or the last retryable error once every replica failed.
    pub async fn links(&self, topic: &str) -> ReplicaResult<Vec<LinkRecord>> {
        let request = AdminRequest::Links {
            topic: topic.to_string(),
        };
        match self.call(request).await? {
            Response::Links(links) => Ok(links),
            _ => Err(ReplicaError::UnexpectedResponse("links")),
        }
    }

    /// Subscriptions of a topic.
    ///
    /// # Errors
    ///
    /// `NoSuchTopic`, or the last retryable error once every replica failed.
    pub async fn subscribers(&self, topic: &str) -> ReplicaResult<Vec<SubscriptionRecord>> {
        let request = AdminRequest::Subscribers {
            topic: topic.to_string(),
        };
        match self.call(request).await? {
            Response::Subscribers(subscribers) => Ok(subscribers),
            _ => Err(ReplicaError::UnexpectedResponse("subscribers")),
        }
    }

    /// A publisher for the topic behind `handle`.
    #[must_use]
    pub fn publisher(&self, handle: TopicHandle) -> Publisher {
        Publisher::new(handle, self.transport.clone())
    }

    async fn mutate(&self, mutation: Mutation) -> ReplicaResult<()> {
        self.call(AdminRequest::Mutate(mutation)).await.map(|_| ())
    }

    async fn call(&self, request: AdminRequest) -> ReplicaResult<Response> {
        let mut candidates: VecDeque<NodeAddr> = self.replicas.iter().cloned().collect();
        let preferred = self.preferred.lock().clone();
        if let Some(preferred) = preferred {
            candidates.retain(|replica| *replica != preferred);
            candidates.push_front(preferred);
        }

        let mut tried = BTreeSet::new();
        let mut last_error = ReplicaError::NoMaster;
        while let Some(replica) = candidates.pop_front() {
            if !tried.insert(replica.clone()) {
                continue;
            }

            let error = match self.call_one(&replica, request.clone()).await {
                Ok(response) => {
                    *self.preferred.lock() = Some(replica);
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            debug!("Admin call to {} failed: {}", replica, error);
            if let Some(master) = error.master() {
                if !tried.contains(master) {
                    candidates.push_front(master.clone());
                }
            }
            last_error = error;
        }

        Err(last_error)
    }

    async fn call_one(&self, replica: &NodeAddr, request: AdminRequest) -> ReplicaResult<Response> {
        let call = self.transport.call(replica, Request::Admin(request));
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Response::Error(e))) => Err(e.into()),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(replica.to_string()).into()),
        }
    }
}
