//! Mutation path and state replication
//!
//! The master validates a mutation against its committed record, writes the
//! resulting change to its store together with the next commit id, applies it
//! to its topics, and pushes it to every follower before answering. A
//! follower applies a pushed change only if it sits directly on top of its own
//! last commit; anything else is answered with `NeedSync` and the master
//! installs a full snapshot instead.

use futures::future::join_all;
use relay_broker::plan_change;
use relay_store::Store;
use relay_topology::{Epoch, NodeAddr};
use relay_transport::{
    CommitId, ErrorKind, Mutation, RecordChange, Request, Response, Role, StateSnapshot,
    TransportError,
};
use tracing::{debug, info, warn};

use crate::coordinator::Inner;
use crate::error::{ReplicaError, ReplicaResult};

impl<S: Store> Inner<S> {
    /// Applies a mutation locally when master, forwards it otherwise.
    pub(crate) async fn mutate(&self, mutation: Mutation) -> ReplicaResult<()> {
        let (role, master, catching_up, fatal) = {
            let state = self.state.lock();
            (
                state.role,
                state.master.clone(),
                state.catching_up,
                state.fatal,
            )
        };

        if fatal {
            return Err(ReplicaError::Fatal(format!(
                "replica {} refuses mutations",
                self.addr
            )));
        }
        if role == Role::Master {
            return self.commit_as_master(mutation).await;
        }
        if catching_up {
            return Err(ReplicaError::CatchingUp);
        }
        let Some(master) = master else {
            return Err(ReplicaError::NoMaster);
        };
        if !self.config.election.forward_mutations {
            return Err(ReplicaError::NotMaster {
                master: Some(master),
            });
        }
        self.forward(&master, mutation).await
    }

    async fn forward(&self, master: &NodeAddr, mutation: Mutation) -> ReplicaResult<()> {
        debug!("Replica {} forwarding {} to {}", self.addr, mutation, master);
        let call = self.transport.call(master, Request::Forward { mutation });

        match tokio::time::timeout(self.config.election.master_timeout, call).await {
            Ok(Ok(Response::Ok)) => Ok(()),
            Ok(Ok(Response::Error(e))) => Err(e.into()),
            Ok(Ok(_)) => Err(ReplicaError::UnexpectedResponse("forward")),
            Ok(Err(e)) => {
                warn!("Master {} unreachable: {}", master, e);
                Err(ReplicaError::NoMaster)
            }
            Err(_) => {
                warn!("Master {} did not answer a forwarded mutation", master);
                Err(ReplicaError::NoMaster)
            }
        }
    }

    pub(crate) async fn on_forward(&self, mutation: Mutation) -> Response {
        let not_master = {
            let state = self.state.lock();
            (state.role != Role::Master).then(|| state.master.clone())
        };
        if let Some(master) = not_master {
            return Response::Error(ReplicaError::NotMaster { master }.into());
        }

        match self.commit_as_master(mutation).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.into()),
        }
    }

    async fn commit_as_master(&self, mutation: Mutation) -> ReplicaResult<()> {
        let _guard = self.mutations.lock().await;
        let (epoch, previous) = {
            let state = self.state.lock();
            if state.fatal {
                return Err(ReplicaError::Fatal(format!(
                    "replica {} refuses mutations",
                    self.addr
                )));
            }
            if state.role != Role::Master {
                return Err(ReplicaError::NotMaster {
                    master: state.master.clone(),
                });
            }
            (state.epoch, state.commit)
        };

        let current = self.manager.record(mutation.topic());
        let Some(change) = plan_change(&self.addr, current.as_ref(), &mutation)? else {
            debug!("Nothing to commit for {}", mutation);
            return Ok(());
        };

        let commit = previous.next(epoch);
        if let Err(e) = self.durable.commit_change(commit, &change).await {
            return Err(self.enter_fatal(&e));
        }
        self.manager.apply_change(change.clone());
        self.state.lock().commit = commit;
        info!("Committed {} as {}", mutation, commit);

        self.broadcast(Request::Replicate {
            master: self.addr.clone(),
            epoch,
            previous,
            commit,
            change,
        })
        .await;
        Ok(())
    }

    /// Sends `request` to every peer and reconciles the ones that answer
    /// that they are out of date.
    ///
    /// Callers hold the mutation lock.
    pub(crate) async fn broadcast(&self, request: Request) {
        let peers = self.peers();
        let replies = join_all(peers.iter().map(|peer| {
            let request = request.clone();
            async move { (peer, self.call_peer(peer, request).await) }
        }))
        .await;

        for (peer, reply) in replies {
            match reply {
                Ok(Response::Ok) => self.mark_current(peer),
                Ok(Response::NeedSync { commit }) => {
                    debug!("Follower {} needs a snapshot (at {})", peer, commit);
                    self.install_on(peer).await;
                }
                Ok(Response::Error(e)) if e.kind == ErrorKind::StaleEpoch => self.step_down(),
                Ok(other) => {
                    warn!("Follower {} answered {}: {:?}", peer, request.name(), other);
                    self.mark_behind(peer);
                }
                Err(e) => {
                    debug!("Follower {} missed {}: {}", peer, request.name(), e);
                    self.mark_behind(peer);
                }
            }
        }
    }

    async fn install_on(&self, peer: &NodeAddr) {
        let (epoch, snapshot) = {
            let state = self.state.lock();
            if state.role != Role::Master {
                return;
            }
            let snapshot = StateSnapshot {
                commit: state.commit,
                topics: self.manager.records(),
            };
            (state.epoch, snapshot)
        };
        let commit = snapshot.commit;
        let request = Request::InstallSnapshot {
            master: self.addr.clone(),
            epoch,
            snapshot,
        };

        match self.call_peer(peer, request).await {
            Ok(Response::Ok) => {
                info!("Follower {} synced to {}", peer, commit);
                self.mark_current(peer);
            }
            Ok(Response::Error(e)) if e.kind == ErrorKind::StaleEpoch => self.step_down(),
            Ok(other) => {
                warn!("Follower {} refused snapshot: {:?}", peer, other);
                self.mark_behind(peer);
            }
            Err(e) => {
                debug!("Snapshot to {} failed: {}", peer, e);
                self.mark_behind(peer);
            }
        }
    }

    fn mark_behind(&self, peer: &NodeAddr) {
        if self.behind.lock().insert(peer.clone()) {
            warn!("Follower {} is behind, it will sync on next contact", peer);
        }
    }

    fn mark_current(&self, peer: &NodeAddr) {
        if self.behind.lock().remove(peer) {
            info!("Follower {} is current again", peer);
        }
    }

    /// Calls a peer, bounded by `response_timeout`.
    pub(crate) async fn call_peer(
        &self,
        peer: &NodeAddr,
        request: Request,
    ) -> ReplicaResult<Response> {
        let call = self.transport.call(peer, request);
        match tokio::time::timeout(self.config.election.response_timeout, call).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(TransportError::Timeout(peer.to_string()).into()),
        }
    }

    /// Handles `Elected` and `Heartbeat`.
    pub(crate) fn on_master_message(
        &self,
        master: &NodeAddr,
        epoch: Epoch,
        commit: CommitId,
    ) -> Response {
        if let Err(response) = self.accept_master(master, epoch) {
            return response;
        }

        let mut state = self.state.lock();
        if state.commit != commit {
            return Response::NeedSync {
                commit: state.commit,
            };
        }
        if state.catching_up {
            info!("Replica {} caught up with {} at {}", self.addr, master, commit);
            state.catching_up = false;
        }
        Response::Ok
    }

    pub(crate) async fn on_replicate(
        &self,
        master: &NodeAddr,
        epoch: Epoch,
        previous: CommitId,
        commit: CommitId,
        change: RecordChange,
    ) -> Response {
        if let Err(response) = self.accept_master(master, epoch) {
            return response;
        }

        let _guard = self.mutations.lock().await;
        let current = self.state.lock().commit;
        if commit == current {
            return Response::Ok;
        }
        if previous != current {
            debug!(
                "Replica {} cannot apply {} on top of {}",
                self.addr, commit, current
            );
            return Response::NeedSync { commit: current };
        }

        if let Err(e) = self.durable.commit_change(commit, &change).await {
            return Response::Error(self.enter_fatal(&e).into());
        }
        self.manager.apply_change(change);
        let mut state = self.state.lock();
        state.commit = commit;
        state.catching_up = false;
        Response::Ok
    }

    pub(crate) async fn on_install(
        &self,
        master: &NodeAddr,
        epoch: Epoch,
        snapshot: StateSnapshot,
    ) -> Response {
        if let Err(response) = self.accept_master(master, epoch) {
            return response;
        }

        let _guard = self.mutations.lock().await;
        match self.install(snapshot).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.into()),
        }
    }

    /// Replaces durable and live state with a snapshot.
    ///
    /// Callers hold the mutation lock.
    pub(crate) async fn install(&self, snapshot: StateSnapshot) -> ReplicaResult<()> {
        if let Err(e) = self.durable.install(&snapshot).await {
            return Err(self.enter_fatal(&e));
        }

        let commit = snapshot.commit;
        self.manager.reconcile(snapshot.topics);
        let mut state = self.state.lock();
        state.commit = commit;
        state.epoch = state.epoch.max(commit.epoch);
        state.catching_up = false;
        info!("Replica {} installed snapshot at {}", self.addr, commit);
        Ok(())
    }

    /// Current state, consistent with the last commit.
    pub(crate) async fn snapshot(&self) -> StateSnapshot {
        let _guard = self.mutations.lock().await;
        StateSnapshot {
            commit: self.state.lock().commit,
            topics: self.manager.records(),
        }
    }
}
