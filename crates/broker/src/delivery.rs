//! Delivery strategies, one per QoS mode

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_topology::{EndpointAddr, TopicRef};
use relay_transport::{Event, Invocation, Qos, QosMode, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BrokerConfig;

/// Result of handing events to a [`DeliveryStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The events were acknowledged or handed off.
    Delivered(usize),
    /// The events were lost without affecting the subscription.
    Dropped(usize),
    /// Delivery failed after every retry.
    Failed(usize),
}

/// The endpoint a strategy delivers to.
pub struct DeliveryTarget<'a> {
    /// Transport used for the delivery.
    pub transport: &'a dyn Transport,
    /// Subscriber endpoint.
    pub endpoint: &'a EndpointAddr,
    /// Fires when the subscription goes away; retries stop early.
    pub cancel: &'a CancellationToken,
}

/// Bounded exponential backoff for acknowledged deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// Upper bound of the delay.
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at zero).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

/// How a subscription's worker hands events to its endpoint.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    /// The QoS mode this strategy implements.
    fn mode(&self) -> QosMode;

    /// Most events taken from the queue per delivery.
    fn batch_size(&self) -> usize {
        1
    }

    /// How long a partial batch waits to fill.
    fn linger(&self) -> Option<Duration> {
        None
    }

    /// Whether a permanent failure removes the subscriber whatever the
    /// overflow policy says.
    fn evicts_on_failure(&self) -> bool {
        false
    }

    /// Delivers `events` to `target`.
    async fn deliver(&self, target: &DeliveryTarget<'_>, events: Vec<Event>) -> DeliveryOutcome;
}

/// Builds the strategy for a subscription's QoS.
#[must_use]
pub fn strategy_for(qos: Qos, config: &BrokerConfig) -> Box<dyn DeliveryStrategy> {
    let retry = RetryPolicy {
        retries: qos.retry_count.unwrap_or(config.send.retry_count),
        backoff: config.send.retry_backoff,
        backoff_max: config.send.retry_backoff_max,
    };

    match qos.mode {
        QosMode::Oneway | QosMode::Datagram => Box::new(FireAndForget { mode: qos.mode }),
        QosMode::Twoway => Box::new(Acknowledged {
            retry,
            ordered: None,
        }),
        QosMode::Ordered => Box::new(Acknowledged {
            retry,
            ordered: Some(Mutex::new(HashMap::new())),
        }),
        QosMode::BatchOneway | QosMode::BatchTwoway => Box::new(Batched {
            acknowledged: qos.mode == QosMode::BatchTwoway,
            retry,
            batch_size: config.flush.batch_size_max,
            linger: config.flush.timeout,
        }),
    }
}

async fn send_with_retry(
    target: &DeliveryTarget<'_>,
    events: &[Event],
    retry: RetryPolicy,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        let error = match target
            .transport
            .deliver(target.endpoint, events.to_vec(), Invocation::Twoway)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if attempt >= retry.retries {
            return Err(error);
        }

        let delay = retry.delay(attempt);
        debug!(
            "Delivery to {} failed ({}), retrying in {:?}",
            target.endpoint, error, delay
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = target.cancel.cancelled() => return Err(error),
        }
        attempt += 1;
    }
}

struct FireAndForget {
    mode: QosMode,
}

#[async_trait]
impl DeliveryStrategy for FireAndForget {
    fn mode(&self) -> QosMode {
        self.mode
    }

    async fn deliver(&self, target: &DeliveryTarget<'_>, events: Vec<Event>) -> DeliveryOutcome {
        let count = events.len();
        match target
            .transport
            .deliver(target.endpoint, events, Invocation::Oneway)
            .await
        {
            Ok(()) => DeliveryOutcome::Delivered(count),
            Err(e) => {
                debug!("{} delivery to {} lost: {}", self.mode, target.endpoint, e);
                DeliveryOutcome::Dropped(count)
            }
        }
    }
}

struct Acknowledged {
    retry: RetryPolicy,
    /// Last sequence delivered per source topic (`None` for local events),
    /// kept for ordered subscriptions only.
    ordered: Option<Mutex<HashMap<Option<TopicRef>, u64>>>,
}

impl Acknowledged {
    /// Drops events at or below the last sequence delivered from their source.
    fn without_replays(&self, events: Vec<Event>) -> Vec<Event> {
        let Some(delivered) = &self.ordered else {
            return events;
        };
        let delivered = delivered.lock();
        events
            .into_iter()
            .filter(|event| {
                let last = delivered.get(&event.source().cloned()).copied().unwrap_or_default();
                if event.sequence > last {
                    return true;
                }
                debug!(
                    "Skipping replayed event {} (already delivered up to {})",
                    event.sequence, last
                );
                false
            })
            .collect()
    }

    fn mark_delivered(&self, events: &[Event]) {
        if let Some(delivered) = &self.ordered {
            let mut delivered = delivered.lock();
            for event in events {
                let last = delivered.entry(event.source().cloned()).or_default();
                *last = (*last).max(event.sequence);
            }
        }
    }
}

#[async_trait]
impl DeliveryStrategy for Acknowledged {
    fn mode(&self) -> QosMode {
        if self.ordered.is_some() {
            QosMode::Ordered
        } else {
            QosMode::Twoway
        }
    }

    fn evicts_on_failure(&self) -> bool {
        self.ordered.is_some()
    }

    async fn deliver(&self, target: &DeliveryTarget<'_>, events: Vec<Event>) -> DeliveryOutcome {
        let offered = events.len();
        let events = self.without_replays(events);
        if events.is_empty() {
            return DeliveryOutcome::Dropped(offered);
        }

        match send_with_retry(target, &events, self.retry).await {
            Ok(()) => {
                self.mark_delivered(&events);
                DeliveryOutcome::Delivered(events.len())
            }
            Err(e) => {
                warn!(
                    "{} delivery to {} failed after {} retries: {}",
                    self.mode(),
                    target.endpoint,
                    self.retry.retries,
                    e
                );
                DeliveryOutcome::Failed(events.len())
            }
        }
    }
}

struct Batched {
    acknowledged: bool,
    retry: RetryPolicy,
    batch_size: usize,
    linger: Duration,
}

#[async_trait]
impl DeliveryStrategy for Batched {
    fn mode(&self) -> QosMode {
        if self.acknowledged {
            QosMode::BatchTwoway
        } else {
            QosMode::BatchOneway
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn linger(&self) -> Option<Duration> {
        Some(self.linger)
    }

    async fn deliver(&self, target: &DeliveryTarget<'_>, events: Vec<Event>) -> DeliveryOutcome {
        let count = events.len();
        debug!("Flushing {} events to {}", count, target.endpoint);

        if !self.acknowledged {
            return match target
                .transport
                .deliver(target.endpoint, events, Invocation::Oneway)
                .await
            {
                Ok(()) => DeliveryOutcome::Delivered(count),
                Err(e) => {
                    debug!("Batch to {} lost: {}", target.endpoint, e);
                    DeliveryOutcome::Dropped(count)
                }
            };
        }

        match send_with_retry(target, &events, self.retry).await {
            Ok(()) => DeliveryOutcome::Delivered(count),
            Err(e) => {
                warn!("Batch of {} to {} failed: {}", count, target.endpoint, e);
                DeliveryOutcome::Failed(count)
            }
        }
    }
}
