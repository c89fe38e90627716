#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_replica::{AdminClient, Coordinator, ReplicaConfig};
use relay_store_memory::MemoryStore;
use relay_topology::{NodeAddr, ReplicaGroup};
use relay_transport::{ReplicaStatus, Role};
use relay_transport_memory::MemoryNetwork;

/// Timeouts short enough for tests, on a paused clock.
pub fn test_config() -> ReplicaConfig {
    let mut config = ReplicaConfig::default();
    config.election.master_timeout = Duration::from_millis(400);
    config.election.election_timeout = Duration::from_millis(200);
    config.election.response_timeout = Duration::from_millis(100);
    config.broker.discard.interval = Duration::from_millis(500);
    config.broker.send.retry_backoff = Duration::from_millis(10);
    config.broker.send.retry_backoff_max = Duration::from_millis(50);
    config
}

/// Polls `condition` every 10ms until it holds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// A replica group on an in-memory network.
///
/// Stopping a replica shuts its coordinator down and removes it from the
/// network; restarting builds a fresh coordinator on the same store.
pub struct TestCluster {
    pub network: MemoryNetwork,
    pub group: ReplicaGroup,
    config: ReplicaConfig,
    stores: BTreeMap<NodeAddr, MemoryStore>,
    replicas: BTreeMap<NodeAddr, Coordinator<MemoryStore>>,
}

impl TestCluster {
    pub async fn new(names: &[&str]) -> Self {
        Self::with_config(MemoryNetwork::new(), names, test_config()).await
    }

    pub async fn with_config(network: MemoryNetwork, names: &[&str], config: ReplicaConfig) -> Self {
        let group = ReplicaGroup::new(names.iter().copied()).unwrap();
        let mut cluster = Self {
            network,
            group,
            config,
            stores: BTreeMap::new(),
            replicas: BTreeMap::new(),
        };

        for name in names {
            let addr = NodeAddr::from(*name);
            cluster.stores.insert(addr.clone(), MemoryStore::new());
            let coordinator = cluster.build(&addr).await;
            cluster.replicas.insert(addr, coordinator);
        }
        // Everyone is reachable before the first election round.
        for coordinator in cluster.replicas.values() {
            coordinator.start();
        }
        cluster
    }

    async fn build(&self, addr: &NodeAddr) -> Coordinator<MemoryStore> {
        let coordinator = Coordinator::new(
            addr.clone(),
            self.group.clone(),
            self.config.clone(),
            Arc::new(self.network.transport(addr.clone())),
            self.stores[addr].clone(),
        )
        .await
        .unwrap();
        self.network
            .register(addr.clone(), Arc::new(coordinator.clone()));
        coordinator
    }

    pub fn replica(&self, name: &str) -> &Coordinator<MemoryStore> {
        &self.replicas[&NodeAddr::from(name)]
    }

    pub fn running(&self) -> impl Iterator<Item = &Coordinator<MemoryStore>> {
        self.replicas.values()
    }

    pub fn store(&self, name: &str) -> &MemoryStore {
        &self.stores[&NodeAddr::from(name)]
    }

    pub fn client(&self) -> AdminClient {
        AdminClient::new(Arc::new(self.network.client()), &self.group)
            .with_timeout(Duration::from_secs(1))
    }

    pub fn statuses(&self) -> Vec<ReplicaStatus> {
        self.replicas.values().map(Coordinator::status).collect()
    }

    pub async fn stop(&mut self, name: &str) {
        let addr = NodeAddr::from(name);
        self.network.deregister(&addr);
        if let Some(coordinator) = self.replicas.remove(&addr) {
            coordinator.shutdown().await;
        }
    }

    pub async fn restart(&mut self, name: &str) {
        let addr = NodeAddr::from(name);
        let coordinator = self.build(&addr).await;
        coordinator.start();
        self.replicas.insert(addr, coordinator);
    }

    /// Waits until the running replicas agree on one master and every
    /// follower holds the master's last commit.
    pub async fn settle(&self) -> NodeAddr {
        let mut master = None;
        wait_until("the group to settle", || {
            master = settled_master(&self.statuses());
            master.is_some()
        })
        .await;
        master.unwrap()
    }

    pub async fn shutdown(self) {
        for coordinator in self.replicas.values() {
            coordinator.shutdown().await;
        }
    }
}

fn settled_master(statuses: &[ReplicaStatus]) -> Option<NodeAddr> {
    let masters: Vec<&ReplicaStatus> = statuses
        .iter()
        .filter(|status| status.role == Role::Master)
        .collect();
    let [master] = masters.as_slice() else {
        return None;
    };

    statuses
        .iter()
        .all(|status| {
            !status.catching_up
                && status.commit == master.commit
                && status.master.as_ref() == Some(&master.addr)
        })
        .then(|| master.addr.clone())
}
