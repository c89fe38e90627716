use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_transport::{ErrorKind, Mutation, RemoteError};
use tokio::sync::Notify;

use crate::sequence::SequenceStore;
use crate::sink::MutationSink;

/// Sink that records submitted mutations without applying them.
#[derive(Default)]
pub(crate) struct RecordingSink {
    mutations: Mutex<Vec<Mutation>>,
    submitted: Notify,
    master: AtomicBool,
    refusing: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn master() -> Self {
        let sink = Self::default();
        sink.master.store(true, Ordering::SeqCst);
        sink
    }

    /// Makes later submissions fail the way they do without a master.
    pub(crate) fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub(crate) fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().clone()
    }

    pub(crate) async fn wait_for(&self, count: usize) -> Vec<Mutation> {
        let wait = async {
            loop {
                let submitted = self.submitted.notified();
                if self.mutations.lock().len() >= count {
                    return;
                }
                submitted.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("mutations were not submitted in time");
        self.mutations()
    }
}

#[async_trait]
impl MutationSink for RecordingSink {
    async fn submit(&self, mutation: Mutation) -> Result<(), RemoteError> {
        self.mutations.lock().push(mutation);
        self.submitted.notify_waiters();
        if self.refusing.load(Ordering::SeqCst) {
            return Err(RemoteError::new(ErrorKind::NoMaster, "no master available"));
        }
        Ok(())
    }

    fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }
}

/// High-water marks kept in memory.
#[derive(Default)]
pub(crate) struct MemorySequences {
    marks: Mutex<HashMap<String, u64>>,
    reserves: AtomicUsize,
    failing: AtomicBool,
}

impl MemorySequences {
    pub(crate) fn reserves(&self) -> usize {
        self.reserves.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SequenceStore for MemorySequences {
    async fn high_water(&self, topic: &str) -> Result<u64, RemoteError> {
        Ok(self.marks.lock().get(topic).copied().unwrap_or_default())
    }

    async fn reserve(&self, topic: &str, mark: u64) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::new(ErrorKind::Internal, "store unavailable"));
        }
        self.reserves.fetch_add(1, Ordering::SeqCst);
        self.marks.lock().insert(topic.to_string(), mark);
        Ok(())
    }
}
