use relay_store::StoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Writes are being rejected (fault injection).
    #[error("store unavailable: writes are failing")]
    Unavailable,
}

impl StoreError for Error {}
