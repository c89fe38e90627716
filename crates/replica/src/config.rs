//! Replica configuration

use std::time::Duration;

use relay_broker::BrokerConfig;
use relay_broker::config::duration_format;
use relay_topology::NodeAddr;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicaError, ReplicaResult};

/// Configuration of one broker replica
///
/// The broker sections (`Topic`, `Flush`, `Send`, `Discard`) sit at the top
/// level of the document next to `Election`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReplicaConfig {
    /// Data plane configuration
    #[serde(flatten)]
    pub broker: BrokerConfig,

    /// Master election
    pub election: ElectionConfig,

    /// Instances handed to publishers; defaults to every replica of the group
    pub replicated_publish_endpoints: Option<Vec<NodeAddr>>,
}

impl ReplicaConfig {
    /// Parses a TOML document and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Config`] if the document does not parse or a
    /// value is out of range.
    pub fn from_toml(document: &str) -> ReplicaResult<Self> {
        let config: Self =
            toml::from_str(document).map_err(|e| ReplicaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Config`] naming the first offending key.
    pub fn validate(&self) -> ReplicaResult<()> {
        self.broker
            .validate()
            .map_err(|e| ReplicaError::Config(e.to_string()))?;

        let election = &self.election;
        if election.master_timeout.is_zero()
            || election.election_timeout.is_zero()
            || election.response_timeout.is_zero()
        {
            return Err(ReplicaError::Config(
                "Election timeouts must be positive".to_string(),
            ));
        }
        if election.response_timeout > election.election_timeout {
            return Err(ReplicaError::Config(
                "Election.ResponseTimeout must not exceed Election.ElectionTimeout".to_string(),
            ));
        }
        if matches!(&self.replicated_publish_endpoints, Some(endpoints) if endpoints.is_empty()) {
            return Err(ReplicaError::Config(
                "ReplicatedPublishEndpoints must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Master election configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ElectionConfig {
    /// Silence from the master after which followers elect a new one; the
    /// master heartbeats every half of it
    #[serde(with = "duration_format")]
    pub master_timeout: Duration,

    /// Bound of one election round
    #[serde(with = "duration_format")]
    pub election_timeout: Duration,

    /// Bound of each call made during an election or replication
    #[serde(with = "duration_format")]
    pub response_timeout: Duration,

    /// Whether followers forward mutations to the master instead of
    /// failing with `NotMaster`
    pub forward_mutations: bool,
}

impl ElectionConfig {
    /// Interval between master heartbeats.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.master_timeout / 2
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            master_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_millis(500),
            forward_mutations: true,
        }
    }
}
