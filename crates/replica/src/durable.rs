//! Durable replica state
//!
//! Layout in the store:
//! - `topic:<name>`: CBOR-encoded [`TopicRecord`]
//! - `meta:commit`: CBOR-encoded [`CommitId`] of the last applied commit
//! - `meta:epoch`: CBOR-encoded [`Epoch`] this replica last led
//! - `meta:seq:<topic>`: CBOR-encoded high-water mark of the topic's
//!   sequence numbers on this replica
//!
//! Every change is written in one [`WriteBatch`] together with the commit it
//! produces, so a crash never leaves records and commit out of step.
//! Sequence marks are local to the replica: snapshots neither carry nor
//! replace them, and they outlive the topic so a recreated topic does not
//! reuse numbers.

use bytes::Bytes;
use relay_store::{Store, WriteBatch};
use relay_topology::Epoch;
use relay_transport::{CommitId, RecordChange, StateSnapshot, TopicRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ReplicaError, ReplicaResult};

const TOPIC_PREFIX: &str = "topic:";
const COMMIT_KEY: &str = "meta:commit";
const EPOCH_KEY: &str = "meta:epoch";
const SEQUENCE_PREFIX: &str = "meta:seq:";

/// State recovered from the store on start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovered {
    /// Last applied commit
    pub commit: CommitId,
    /// Highest epoch this replica knows of
    pub epoch: Epoch,
    /// Every topic record, ordered by name
    pub topics: Vec<TopicRecord>,
}

/// Typed access to the replica's durable state.
#[derive(Clone)]
pub struct DurableState<S: Store> {
    store: S,
}

impl<S: Store> DurableState<S> {
    /// Wraps a store.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Loads every record together with the last commit and epoch.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or holds an undecodable value.
    pub async fn load(&self) -> ReplicaResult<Recovered> {
        let commit: CommitId = self.read(COMMIT_KEY).await?.unwrap_or_default();
        let saved_epoch: Epoch = self.read(EPOCH_KEY).await?.unwrap_or_default();

        let mut keys: Vec<String> = self
            .store
            .keys()
            .await
            .map_err(store_error)?
            .into_iter()
            .filter(|key| key.starts_with(TOPIC_PREFIX))
            .collect();
        keys.sort();

        let mut topics = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read::<TopicRecord>(&key).await? {
                topics.push(record);
            }
        }

        debug!(
            "Loaded {} topics at commit {} (epoch {})",
            topics.len(),
            commit,
            saved_epoch
        );

        Ok(Recovered {
            commit,
            epoch: saved_epoch.max(commit.epoch),
            topics,
        })
    }

    /// Atomically writes one change and the commit it produces.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the batch; nothing is written then.
    pub async fn commit_change(&self, commit: CommitId, change: &RecordChange) -> ReplicaResult<()> {
        let mut batch = WriteBatch::new();
        match change {
            RecordChange::Put(record) => {
                batch.put(topic_key(&record.name), encode(record)?);
            }
            RecordChange::Delete(name) => {
                batch.delete(topic_key(name));
            }
        }
        batch.put(COMMIT_KEY, encode(&commit)?);
        self.store.commit(batch).await.map_err(store_error)
    }

    /// Replaces every record with the snapshot's content.
    pub async fn install(&self, snapshot: &StateSnapshot) -> ReplicaResult<()> {
        let mut batch = WriteBatch::new();
        for key in self.store.keys().await.map_err(store_error)? {
            let keep = key
                .strip_prefix(TOPIC_PREFIX)
                .is_some_and(|name| snapshot.topics.iter().any(|record| record.name == name));
            if key.starts_with(TOPIC_PREFIX) && !keep {
                batch.delete(key);
            }
        }
        for record in &snapshot.topics {
            batch.put(topic_key(&record.name), encode(record)?);
        }
        batch.put(COMMIT_KEY, encode(&snapshot.commit)?);
        self.store.commit(batch).await.map_err(store_error)
    }

    /// Records the epoch this replica is about to lead.
    pub async fn save_epoch(&self, epoch: Epoch) -> ReplicaResult<()> {
        self.store
            .put(EPOCH_KEY, encode(&epoch)?)
            .await
            .map_err(store_error)
    }

    /// The high-water mark of a topic's sequence numbers, zero when none
    /// was saved.
    pub async fn sequence_mark(&self, topic: &str) -> ReplicaResult<u64> {
        Ok(self.read(&sequence_key(topic)).await?.unwrap_or_default())
    }

    /// Saves the high-water mark of a topic's sequence numbers.
    pub async fn save_sequence_mark(&self, topic: &str, mark: u64) -> ReplicaResult<()> {
        self.store
            .put(sequence_key(topic), encode(&mark)?)
            .await
            .map_err(store_error)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> ReplicaResult<Option<T>> {
        match self.store.get(key).await.map_err(store_error)? {
            Some(bytes) => ciborium::de::from_reader(&bytes[..])
                .map(Some)
                .map_err(|e| ReplicaError::Codec(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }
}

fn topic_key(name: &str) -> String {
    format!("{TOPIC_PREFIX}{name}")
}

fn sequence_key(topic: &str) -> String {
    format!("{SEQUENCE_PREFIX}{topic}")
}

fn encode<T: Serialize>(value: &T) -> ReplicaResult<Bytes> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer).map_err(|e| ReplicaError::Codec(e.to_string()))?;
    Ok(Bytes::from(buffer))
}

fn store_error<E: std::error::Error>(error: E) -> ReplicaError {
    ReplicaError::Store(error.to_string())
}
