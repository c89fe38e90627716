//! Broker configuration
//!
//! Keys follow the broker's property names, grouped into sections:
//!
//! ```toml
//! [Topic]
//! QueueSizeMax = 400
//! QueueSizeMaxPolicy = "RemoveSubscriber"
//!
//! [Discard]
//! Interval = "2s"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Broker configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BrokerConfig {
    /// Per-topic queue settings
    pub topic: TopicConfig,

    /// Batch flushing
    pub flush: FlushConfig,

    /// Acknowledged delivery retries
    pub send: SendConfig,

    /// Federation link liveness checks
    pub discard: DiscardConfig,
}

impl BrokerConfig {
    /// Parses a TOML document and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if the document does not parse or a
    /// value is out of range.
    pub fn from_toml(document: &str) -> BrokerResult<Self> {
        let config: Self =
            toml::from_str(document).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] naming the first offending key.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.topic.queue_size_max == 0 {
            return Err(BrokerError::Config(
                "Topic.QueueSizeMax must be positive".to_string(),
            ));
        }
        if self.flush.batch_size_max == 0 {
            return Err(BrokerError::Config(
                "Flush.BatchSizeMax must be positive".to_string(),
            ));
        }
        if self.flush.timeout.is_zero() {
            return Err(BrokerError::Config(
                "Flush.Timeout must be positive".to_string(),
            ));
        }
        if self.send.retry_backoff > self.send.retry_backoff_max {
            return Err(BrokerError::Config(
                "Send.RetryBackoff must not exceed Send.RetryBackoffMax".to_string(),
            ));
        }
        if self.discard.interval.is_zero() {
            return Err(BrokerError::Config(
                "Discard.Interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// What happens when a subscriber's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the incoming event and keep the subscriber
    #[default]
    DropEvents,

    /// Remove the subscriber
    RemoveSubscriber,
}

/// Per-topic queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TopicConfig {
    /// Events a subscriber or link queue holds before the overflow policy applies
    pub queue_size_max: usize,

    /// Overflow policy
    pub queue_size_max_policy: OverflowPolicy,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            queue_size_max: 1000,
            queue_size_max_policy: OverflowPolicy::DropEvents,
        }
    }
}

/// Batch flushing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FlushConfig {
    /// Longest time an event waits for its batch to fill
    #[serde(with = "duration_format")]
    pub timeout: Duration,

    /// Events per batch
    pub batch_size_max: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            batch_size_max: 100,
        }
    }
}

/// Acknowledged delivery retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SendConfig {
    /// Retries before a delivery fails permanently, unless the subscription
    /// overrides it
    pub retry_count: u32,

    /// Delay before the first retry
    #[serde(with = "duration_format")]
    pub retry_backoff: Duration,

    /// Upper bound of the doubling retry delay
    #[serde(with = "duration_format")]
    pub retry_backoff_max: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
        }
    }
}

/// Federation link liveness checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DiscardConfig {
    /// Period of the link probes
    #[serde(with = "duration_format")]
    pub interval: Duration,
}

impl Default for DiscardConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Serde adapter for human-readable durations such as `"1s"` or `"250ms"`.
pub mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a duration as a human-readable string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    /// Parses a human-readable duration.
    ///
    /// # Errors
    ///
    /// Fails if the string is not a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
