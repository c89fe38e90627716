//! Transport failure outcomes

use thiserror::Error;

/// Outcome of a failed RPC invocation.
///
/// The connectivity variants mirror the failures a real transport reports:
/// the peer refused the connection, the connection could not be established,
/// or it dropped mid-call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The target is known but is not accepting calls
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    /// The target could not be reached
    #[error("failed to connect to {0}")]
    ConnectFailed(String),

    /// The connection was lost while the call was in flight
    #[error("connection to {0} lost")]
    ConnectionLost(String),

    /// The call did not complete within its deadline
    #[error("call to {0} timed out")]
    Timeout(String),

    /// The subscriber endpoint received the events but failed to process them
    #[error("endpoint {endpoint} rejected delivery: {reason}")]
    Rejected {
        /// The endpoint that rejected the call
        endpoint: String,
        /// The reason given by the endpoint
        reason: String,
    },
}

impl TransportError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_)
                | Self::ConnectFailed(_)
                | Self::ConnectionLost(_)
                | Self::Timeout(_)
        )
    }
}
