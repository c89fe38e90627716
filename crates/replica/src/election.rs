//! Master election
//!
//! Every replica runs one control loop. What the loop does depends on the
//! replica's [`Role`]:
//! - `Electing`: run a candidacy round and either follow an existing master,
//!   win, or wait for the winner's announcement
//! - `Follower`: watch for master heartbeats and fall back to `Electing`
//!   after `master_timeout` of silence
//! - `Master`: heartbeat the followers every `master_timeout / 2`
//!
//! Epochs are ballots: a replica only ever leads epochs it owns (see
//! [`Epoch::next_for`]), so two replicas never lead the same epoch.

use std::sync::Arc;

use futures::future::join_all;
use relay_store::Store;
use relay_topology::{Epoch, NodeAddr};
use relay_transport::{ReplicaStatus, Request, Response, Role};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::Inner;
use crate::error::ReplicaError;

impl<S: Store> Inner<S> {
    pub(crate) async fn run(self: Arc<Self>) {
        info!(
            "Replica {} joining group of {} (epoch {})",
            self.addr,
            self.group.len(),
            self.state.lock().epoch
        );

        loop {
            let role = self.state.lock().role;
            let step = async {
                match role {
                    Role::Electing => self.elect().await,
                    Role::Follower => self.follow().await,
                    Role::Master => self.lead().await,
                }
            };

            tokio::select! {
                () = step => {}
                () = self.cancel.cancelled() => {
                    info!("Replica {} leaving its group", self.addr);
                    return;
                }
            }
        }
    }

    /// Runs one candidacy round.
    async fn elect(&self) {
        let (known, own_commit, fatal) = {
            let state = self.state.lock();
            (state.epoch, state.commit, state.fatal)
        };
        let group_size = self.group.len();
        let request = Request::Candidacy {
            candidate: self.addr.clone(),
            epoch: known.next_for(self.index, group_size),
        };
        debug!("Replica {} starting election after epoch {}", self.addr, known);

        let peers = self.peers();
        let replies = join_all(
            peers
                .iter()
                .map(|peer| self.call_peer(peer, request.clone())),
        )
        .await;
        let statuses: Vec<ReplicaStatus> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(Response::Status(status)) => Some(status),
                _ => None,
            })
            .collect();

        if let Some(master) = statuses
            .iter()
            .filter(|status| status.role == Role::Master && status.epoch >= known)
            .max_by_key(|status| status.epoch)
        {
            debug!(
                "Replica {} found master {} at epoch {}",
                self.addr, master.addr, master.epoch
            );
            if self.accept_master(&master.addr, master.epoch).is_err() {
                self.await_role_change().await;
            }
            return;
        }

        let seen = statuses
            .iter()
            .map(|status| status.epoch)
            .fold(known, Epoch::max);
        if seen > known {
            let mut state = self.state.lock();
            state.epoch = state.epoch.max(seen);
        }

        let winner = statuses
            .iter()
            .filter(|status| !status.fatal)
            .map(|status| &status.addr)
            .chain((!fatal).then_some(&self.addr))
            .max();
        if winner != Some(&self.addr) {
            debug!(
                "Replica {} defers to {}",
                self.addr,
                winner.map_or("nobody", NodeAddr::as_str)
            );
            self.await_role_change().await;
            return;
        }

        let freshest = statuses
            .iter()
            .filter(|status| status.commit > own_commit)
            .max_by_key(|status| status.commit);
        if let Some(freshest) = freshest {
            if !self.pull_state(&freshest.addr).await {
                self.await_role_change().await;
                return;
            }
        }

        let epoch = seen.next_for(self.index, group_size);
        if let Err(e) = self.durable.save_epoch(epoch).await {
            self.enter_fatal(&e);
            return;
        }
        self.become_master(epoch).await;
    }

    /// Installs the state of a peer whose last commit is newer than ours.
    async fn pull_state(&self, peer: &NodeAddr) -> bool {
        info!("Replica {} pulling state from {}", self.addr, peer);
        match self.call_peer(peer, Request::FetchSnapshot).await {
            Ok(Response::Snapshot(snapshot)) => {
                let _guard = self.mutations.lock().await;
                self.install(snapshot).await.is_ok()
            }
            Ok(other) => {
                warn!("Unexpected answer to snapshot fetch from {}: {:?}", peer, other);
                false
            }
            Err(e) => {
                warn!("Failed to pull state from {}: {}", peer, e);
                false
            }
        }
    }

    async fn become_master(&self, epoch: Epoch) {
        let _guard = self.mutations.lock().await;
        let commit = {
            let mut state = self.state.lock();
            if state.role != Role::Electing || state.epoch > epoch {
                return;
            }
            state.role = Role::Master;
            state.epoch = epoch;
            state.master = Some(self.addr.clone());
            state.catching_up = false;
            state.commit
        };
        self.behind.lock().clear();
        info!(
            "Replica {} is master for epoch {} at commit {}",
            self.addr, epoch, commit
        );
        self.role_changed.notify_waiters();

        self.broadcast(Request::Elected {
            master: self.addr.clone(),
            epoch,
            commit,
        })
        .await;
    }

    /// Waits until the master's silence exceeds `master_timeout`.
    async fn follow(&self) {
        let master_timeout = self.config.election.master_timeout;
        let deadline = self.state.lock().last_heard + master_timeout;
        tokio::time::sleep_until(deadline).await;

        let mut state = self.state.lock();
        if state.role != Role::Follower || state.last_heard + master_timeout > Instant::now() {
            return;
        }
        warn!(
            "Replica {} lost contact with master {}",
            self.addr,
            state.master.as_ref().map_or("unknown", NodeAddr::as_str)
        );
        state.role = Role::Electing;
        state.master = None;
        drop(state);
        self.role_changed.notify_waiters();
    }

    /// Sends one round of heartbeats.
    async fn lead(&self) {
        let notified = self.role_changed.notified();
        let interval = self.config.election.heartbeat_interval();
        if tokio::time::timeout(interval, notified).await.is_ok() {
            return;
        }

        let _guard = self.mutations.lock().await;
        let (epoch, commit) = {
            let state = self.state.lock();
            if state.role != Role::Master {
                return;
            }
            (state.epoch, state.commit)
        };
        self.broadcast(Request::Heartbeat {
            master: self.addr.clone(),
            epoch,
            commit,
        })
        .await;
    }

    async fn await_role_change(&self) {
        let notified = self.role_changed.notified();
        if self.state.lock().role != Role::Electing {
            return;
        }
        let _ = tokio::time::timeout(self.config.election.election_timeout, notified).await;
    }

    /// Adopts `master` as leader of `epoch`.
    ///
    /// Fails with the `StaleEpoch` reply when this replica knows a newer
    /// epoch, or already leads this one, and with the `ForeignEpoch` reply
    /// when `epoch` is not a ballot of `master` in this group.
    pub(crate) fn accept_master(&self, master: &NodeAddr, epoch: Epoch) -> Result<(), Response> {
        let mut state = self.state.lock();
        if epoch < state.epoch || (epoch == state.epoch && state.role == Role::Master) {
            debug!(
                "Replica {} rejecting {} at stale epoch {} (current {})",
                self.addr, master, epoch, state.epoch
            );
            return Err(Response::Error(ReplicaError::StaleEpoch(state.epoch).into()));
        }

        let owner = epoch.owner(self.group.len());
        if self.group.index_of(master).ok() != Some(owner) {
            debug!(
                "Replica {} rejecting {}, it does not own epoch {}",
                self.addr, master, epoch
            );
            return Err(Response::Error(
                ReplicaError::ForeignEpoch {
                    master: master.clone(),
                    epoch,
                }
                .into(),
            ));
        }

        let changed = state.role != Role::Follower || state.master.as_ref() != Some(master);
        if state.role == Role::Master {
            warn!(
                "Replica {} stepping down, {} leads epoch {}",
                self.addr, master, epoch
            );
        }
        state.role = Role::Follower;
        state.epoch = epoch;
        state.master = Some(master.clone());
        state.last_heard = Instant::now();
        drop(state);

        if changed {
            info!(
                "Replica {} following master {} (epoch {})",
                self.addr, master, epoch
            );
            self.role_changed.notify_waiters();
        }
        Ok(())
    }

    /// Gives up mastership after a peer reported a newer epoch.
    pub(crate) fn step_down(&self) {
        let mut state = self.state.lock();
        if state.role != Role::Master {
            return;
        }
        warn!(
            "Replica {} stepping down from epoch {}, a newer epoch exists",
            self.addr, state.epoch
        );
        state.role = Role::Electing;
        state.master = None;
        drop(state);
        self.role_changed.notify_waiters();
    }

    /// Marks the replica as unable to commit.
    pub(crate) fn enter_fatal(&self, cause: &ReplicaError) -> ReplicaError {
        let mut state = self.state.lock();
        if !state.fatal {
            error!(
                "Replica {} refusing further mutations after store failure: {}",
                self.addr, cause
            );
            state.fatal = true;
        }
        ReplicaError::Fatal(cause.to_string())
    }
}
