use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Delivery counters of one topic.
#[derive(Debug, Default)]
pub(crate) struct TopicStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    removed_subscribers: AtomicU64,
}

impl TopicStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, count: usize) {
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed_subscriber(&self) {
        self.removed_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            removed_subscribers: self.removed_subscribers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a topic's delivery counters.
///
/// Counters start at zero when the topic is instantiated on this broker
/// instance; they are not replicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Events published to the topic
    pub published: u64,
    /// Events acknowledged by, or handed off to, subscriber endpoints
    pub delivered: u64,
    /// Events discarded by overflow, failed delivery or offline links
    pub dropped: u64,
    /// Events forwarded over links
    pub forwarded: u64,
    /// Subscriptions evicted by the data plane
    pub removed_subscribers: u64,
}
