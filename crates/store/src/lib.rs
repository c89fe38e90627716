//! Abstract interface for the durable key-value store backing broker state.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for store errors
pub trait StoreError: Debug + Error + Send + Sync + 'static {}

/// A single write inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Store `value` under `key`.
    Put {
        /// The key to write.
        key: String,
        /// The value to store.
        value: Bytes,
    },

    /// Remove `key`.
    Delete {
        /// The key to remove.
        key: String,
    },
}

/// A set of writes applied atomically by [`Store::commit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Adds a put to the batch.
    pub fn put<K: Into<String>>(&mut self, key: K, value: Bytes) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    /// Adds a delete to the batch.
    pub fn delete<K: Into<String>>(&mut self, key: K) -> &mut Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    /// Whether the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The writes in insertion order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch, returning its writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// A trait representing a key-value store with asynchronous operations.
///
/// Writes issued through [`Store::commit`] are all-or-nothing: after a
/// successful commit every write in the batch is visible, after a failed one
/// none of them is.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// The error type for the store.
    type Error: StoreError;

    /// Atomically applies every write in `batch`.
    async fn commit(&self, batch: WriteBatch) -> Result<(), Self::Error>;

    /// Deletes a key from the store.
    async fn del<K: Into<String> + Send>(&self, key: K) -> Result<(), Self::Error>;

    /// Retrieves the value associated with a key.
    async fn get<K: Into<String> + Send>(&self, key: K) -> Result<Option<Bytes>, Self::Error>;

    /// Retrieves all keys in the store.
    async fn keys(&self) -> Result<Vec<String>, Self::Error>;

    /// Stores a key-value pair.
    async fn put<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch
            .put("a", Bytes::from_static(b"1"))
            .delete("b")
            .put("c", Bytes::from_static(b"3"));

        assert_eq!(
            batch.ops(),
            &[
                WriteOp::Put {
                    key: "a".to_string(),
                    value: Bytes::from_static(b"1"),
                },
                WriteOp::Delete {
                    key: "b".to_string()
                },
                WriteOp::Put {
                    key: "c".to_string(),
                    value: Bytes::from_static(b"3"),
                },
            ]
        );
    }
}
