//! Generic transport abstraction for broker communication
//!
//! This crate provides a transport-agnostic interface. The broker core treats
//! every remote interaction as one of two opaque invocations:
//! - `call`: a request/response exchange with another broker instance
//!   (replica control traffic, federation forwarding, administration)
//! - `deliver`: handing events to a subscriber endpoint
//!
//! Connection management, marshaling and timeouts belong to implementations.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod messages;
pub mod records;

pub use error::TransportError;
pub use messages::{
    AdminRequest, ErrorKind, RemoteError, ReplicaStatus, Request, Response, Role,
};
pub use records::{
    CommitId, Event, LinkRecord, Mutation, Qos, QosMode, RecordChange, StateSnapshot,
    SubscriptionRecord, TopicHandle, TopicRecord,
};

use async_trait::async_trait;
use relay_topology::{EndpointAddr, NodeAddr};

/// How the caller waits on a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invocation {
    /// Return once the events are handed to the transport.
    Oneway,
    /// Return once the endpoint acknowledged the events.
    Twoway,
}

/// Transport trait for reaching broker instances and subscriber endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request to a broker instance and wait for its response.
    async fn call(&self, target: &NodeAddr, request: Request) -> Result<Response, TransportError>;

    /// Deliver events to a subscriber endpoint.
    ///
    /// With [`Invocation::Oneway`] a successful return only means the events
    /// left this process.
    async fn deliver(
        &self,
        endpoint: &EndpointAddr,
        events: Vec<Event>,
        invocation: Invocation,
    ) -> Result<(), TransportError>;
}

/// Server side of [`Transport::call`].
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request.
    async fn handle(&self, request: Request) -> Response;
}

/// Server side of [`Transport::deliver`], implemented by subscribers.
#[async_trait]
pub trait SubscriberHandler: Send + Sync + 'static {
    /// Process delivered events. An error rejects the whole delivery.
    async fn handle(&self, events: Vec<Event>) -> Result<(), String>;
}
