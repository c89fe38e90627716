//! In-memory transport implementation for testing
//!
//! Routes requests between broker instances and deliveries to subscriber
//! endpoints within the same process. A [`MemoryNetwork`] is an explicit
//! instance rather than a process-wide registry, so tests running in parallel
//! never see each other's nodes. It also lets tests inject faults: nodes and
//! endpoints can be made unreachable, and pairs of nodes can be partitioned.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod endpoint;

pub use endpoint::RecordingEndpoint;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use relay_topology::{EndpointAddr, NodeAddr};
use relay_transport::{
    Event, Invocation, Request, RequestHandler, Response, SubscriberHandler, Transport,
    TransportError,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct NetworkState {
    nodes: DashMap<NodeAddr, Arc<dyn RequestHandler>>,
    endpoints: DashMap<EndpointAddr, Arc<dyn SubscriberHandler>>,
    unreachable_nodes: DashSet<NodeAddr>,
    unreachable_endpoints: DashSet<EndpointAddr>,
    partitions: DashSet<(NodeAddr, NodeAddr)>,
}

impl NetworkState {
    fn partitioned(&self, a: &NodeAddr, b: &NodeAddr) -> bool {
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.partitions.contains(&key)
    }
}

/// A simulated network connecting broker instances and subscriber endpoints.
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the request handler of a broker instance, replacing any
    /// previous handler for the same address.
    pub fn register(&self, addr: NodeAddr, handler: Arc<dyn RequestHandler>) {
        debug!("Registering memory node {}", addr);
        self.state.nodes.insert(addr, handler);
    }

    /// Removes a broker instance. Subsequent calls are refused.
    pub fn deregister(&self, addr: &NodeAddr) {
        debug!("Deregistering memory node {}", addr);
        self.state.nodes.remove(addr);
    }

    /// Whether a broker instance is registered.
    #[must_use]
    pub fn is_registered(&self, addr: &NodeAddr) -> bool {
        self.state.nodes.contains_key(addr)
    }

    /// Registers a subscriber endpoint.
    pub fn register_endpoint(&self, endpoint: EndpointAddr, handler: Arc<dyn SubscriberHandler>) {
        debug!("Registering memory endpoint {}", endpoint);
        self.state.endpoints.insert(endpoint, handler);
    }

    /// Removes a subscriber endpoint.
    pub fn deregister_endpoint(&self, endpoint: &EndpointAddr) {
        debug!("Deregistering memory endpoint {}", endpoint);
        self.state.endpoints.remove(endpoint);
    }

    /// Makes a broker instance reachable or unreachable.
    ///
    /// An unreachable instance can neither be called nor call out, but keeps
    /// its registration so it comes back with its state intact.
    pub fn set_reachable(&self, addr: &NodeAddr, reachable: bool) {
        if reachable {
            self.state.unreachable_nodes.remove(addr);
        } else {
            self.state.unreachable_nodes.insert(addr.clone());
        }
    }

    /// Makes a subscriber endpoint reachable or unreachable.
    pub fn set_endpoint_reachable(&self, endpoint: &EndpointAddr, reachable: bool) {
        if reachable {
            self.state.unreachable_endpoints.remove(endpoint);
        } else {
            self.state.unreachable_endpoints.insert(endpoint.clone());
        }
    }

    /// Cuts the link between two broker instances in both directions.
    pub fn partition(&self, a: &NodeAddr, b: &NodeAddr) {
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.state.partitions.insert(key);
    }

    /// Restores every link cut by [`MemoryNetwork::partition`].
    pub fn heal(&self) {
        self.state.partitions.clear();
    }

    /// Returns a transport that sends on behalf of `local`.
    #[must_use]
    pub fn transport(&self, local: NodeAddr) -> MemoryTransport {
        MemoryTransport {
            local: Some(local),
            network: self.clone(),
        }
    }

    /// Returns a transport for a client that is not itself a broker instance.
    #[must_use]
    pub fn client(&self) -> MemoryTransport {
        MemoryTransport {
            local: None,
            network: self.clone(),
        }
    }
}

/// Transport handle bound to one sender on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: Option<NodeAddr>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// The sending broker instance, if any.
    #[must_use]
    pub const fn local(&self) -> Option<&NodeAddr> {
        self.local.as_ref()
    }

    fn check_route(&self, target: &NodeAddr) -> Result<(), TransportError> {
        let state = &self.network.state;

        if state.unreachable_nodes.contains(target) {
            return Err(TransportError::ConnectFailed(target.to_string()));
        }

        if let Some(local) = &self.local {
            if state.unreachable_nodes.contains(local) || state.partitioned(local, target) {
                return Err(TransportError::ConnectFailed(target.to_string()));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, target: &NodeAddr, request: Request) -> Result<Response, TransportError> {
        self.check_route(target)?;

        let handler = self
            .network
            .state
            .nodes
            .get(target)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::ConnectionRefused(target.to_string()))?;

        let call_id = Uuid::new_v4();
        trace!("Call {} {} -> {}", call_id, request.name(), target);

        // The handler runs to completion even when the caller gives up, as a
        // remote server would.
        let response = tokio::spawn(async move { handler.handle(request).await })
            .await
            .map_err(|_| TransportError::ConnectionLost(target.to_string()))?;

        trace!("Call {} answered", call_id);

        Ok(response)
    }

    async fn deliver(
        &self,
        endpoint: &EndpointAddr,
        events: Vec<Event>,
        invocation: Invocation,
    ) -> Result<(), TransportError> {
        let state = &self.network.state;

        if state.unreachable_endpoints.contains(endpoint)
            || self
                .local
                .as_ref()
                .is_some_and(|local| state.unreachable_nodes.contains(local))
        {
            return Err(TransportError::ConnectFailed(endpoint.to_string()));
        }

        let handler = state
            .endpoints
            .get(endpoint)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::ConnectionRefused(endpoint.to_string()))?;

        let endpoint_name = endpoint.to_string();
        let task = tokio::spawn(async move { handler.handle(events).await });

        match invocation {
            Invocation::Oneway => Ok(()),
            Invocation::Twoway => match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => {
                    warn!("Endpoint {} rejected delivery: {}", endpoint_name, reason);
                    Err(TransportError::Rejected {
                        endpoint: endpoint_name,
                        reason,
                    })
                }
                Err(_) => Err(TransportError::ConnectionLost(endpoint_name)),
            },
        }
    }
}
