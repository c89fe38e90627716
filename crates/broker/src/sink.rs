use async_trait::async_trait;
use relay_transport::{Mutation, RemoteError};

/// Where the data plane submits mutations of its own.
///
/// Evicting a subscriber and reaping a dead link change durable topic state,
/// so they travel the same replicated path as administrative calls. The
/// replica coordinator implements this trait.
#[async_trait]
pub trait MutationSink: Send + Sync + 'static {
    /// Submits a mutation and waits until it is committed.
    async fn submit(&self, mutation: Mutation) -> Result<(), RemoteError>;

    /// Whether this broker instance currently commits mutations itself.
    fn is_master(&self) -> bool;
}
