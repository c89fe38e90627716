//! In-memory (single process) implementation of the durable store for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use relay_store::{Store, WriteBatch, WriteOp};
use tokio::sync::Mutex;

/// In-memory key-value store.
///
/// Clones share the same underlying map, so a clone handed to a restarted
/// replica sees everything the previous instance committed.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<HashMap<String, Bytes>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Creates a new `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until called again with `false`.
    pub fn fail_commits(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Error = Error;

    async fn commit(&self, batch: WriteBatch) -> Result<(), Self::Error> {
        self.check_writable()?;

        // Holding the lock across the whole batch makes it atomic for readers.
        let mut map = self.map.lock().await;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }

        Ok(())
    }

    async fn del<K: Into<String> + Send>(&self, key: K) -> Result<(), Self::Error> {
        self.check_writable()?;
        self.map.lock().await.remove(&key.into());
        Ok(())
    }

    async fn get<K: Into<String> + Send>(&self, key: K) -> Result<Option<Bytes>, Self::Error> {
        let map = self.map.lock().await;
        Ok(map.get(&key.into()).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.map.lock().await.keys().cloned().collect())
    }

    async fn put<K: Into<String> + Send>(&self, key: K, bytes: Bytes) -> Result<(), Self::Error> {
        self.check_writable()?;
        self.map.lock().await.insert(key.into(), bytes);
        Ok(())
    }
}
