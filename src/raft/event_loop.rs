//! Drives the consensus core: election timeouts, replication rounds,
//! lease checks, and snapshot catch-up for lagging peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use prost::Message;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};

use crate::config::RaftConfig;
use crate::net::{read_frame, write_frame, RaftClient, StreamLayer, STATUS_OK, STREAM_TAG};
use crate::raft::membership::Server;
use crate::raft::node::{RaftNode, ServerState};

/// Last instant a valid leader (or a candidate we granted a vote) was
/// heard from. Shared between the inbound RPC handlers, which reset it,
/// and the event loop, which times out on it.
#[derive(Clone)]
pub struct LeaderContact(Arc<Mutex<Instant>>);

impl LeaderContact {
    pub fn new() -> Self {
        LeaderContact(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn reset(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

impl Default for LeaderContact {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct RaftEventLoop {
    node: Arc<Mutex<RaftNode>>,
    client: RaftClient,
    layer: StreamLayer,
    config: RaftConfig,
    contact: LeaderContact,
    wake: Arc<Notify>,
}

impl RaftEventLoop {
    pub fn new(
        node: Arc<Mutex<RaftNode>>,
        client: RaftClient,
        layer: StreamLayer,
        config: RaftConfig,
        contact: LeaderContact,
        wake: Arc<Notify>,
    ) -> Self {
        RaftEventLoop {
            node,
            client,
            layer,
            config,
            contact,
            wake,
        }
    }

    /// Runs until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut election_deadline = self.randomized_election_timeout();

        loop {
            if *shutdown.borrow() {
                debug!("event loop shutting down");
                return;
            }

            let state = self.node.lock().server_state();
            match state {
                ServerState::Follower | ServerState::Candidate => {
                    let elapsed = self.contact.elapsed();
                    if elapsed >= election_deadline {
                        self.run_election().await;
                        self.contact.reset();
                        election_deadline = self.randomized_election_timeout();
                    } else {
                        let wait = election_deadline - elapsed;
                        tokio::select! {
                            _ = sleep(wait) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                ServerState::Leader => {
                    self.replicate_once().await;
                    self.node
                        .lock()
                        .check_leader_lease(self.config.leader_lease_timeout);
                    tokio::select! {
                        _ = sleep(self.config.commit_timeout) => {}
                        _ = self.wake.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    async fn run_election(&self) {
        let (request, peers) = {
            let mut node = self.node.lock();
            let request = match node.start_election() {
                Ok(Some(request)) => request,
                // Not a voter (or no membership yet): stay passive.
                Ok(None) => return,
                Err(err) => {
                    warn!("could not start election: {err}");
                    return;
                }
            };
            // A single-voter cluster wins with its own ballot.
            if node.election_won() {
                node.become_leader();
                self.wake.notify_one();
                return;
            }
            (request, self.peer_list(&node))
        };

        let mut ballots = Vec::new();
        for (peer_id, addr) in peers {
            let client = self.client.clone();
            let request = request.clone();
            let rpc_timeout = self.config.heartbeat_timeout;
            ballots.push(tokio::spawn(async move {
                let result = timeout(rpc_timeout, client.request_vote(&addr, request)).await;
                (peer_id, result)
            }));
        }

        for ballot in ballots {
            let Ok((peer_id, result)) = ballot.await else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let mut node = self.node.lock();
                    match node.handle_vote_response(&peer_id, response) {
                        Ok(true) => {
                            self.wake.notify_one();
                            return;
                        }
                        Ok(false) => {}
                        Err(err) => warn!("vote bookkeeping failed: {err}"),
                    }
                }
                Ok(Err(err)) => debug!("vote request to {peer_id} failed: {err}"),
                Err(_) => debug!("vote request to {peer_id} timed out"),
            }
        }
    }

    async fn replicate_once(&self) {
        let (requests, snapshot_peers) = {
            let node = self.node.lock();
            match node.replication_round() {
                Ok(round) => round,
                Err(err) => {
                    warn!("replication round failed: {err}");
                    return;
                }
            }
        };

        let mut rounds = Vec::new();
        for (server, request) in requests {
            let client = self.client.clone();
            let rpc_timeout = self.config.heartbeat_timeout;
            rounds.push(tokio::spawn(async move {
                let result =
                    timeout(rpc_timeout, client.append_entries(&server.addr, request.clone()))
                        .await;
                (server, request, result)
            }));
        }

        for round in rounds {
            let Ok((server, request, result)) = round.await else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let mut node = self.node.lock();
                    if let Err(err) =
                        node.handle_append_entries_response(&server.id, &request, response)
                    {
                        warn!("replication bookkeeping failed: {err}");
                    }
                }
                Ok(Err(err)) => debug!("append entries to {} failed: {err}", server.id),
                Err(_) => debug!("append entries to {} timed out", server.id),
            }
        }

        for server in snapshot_peers {
            self.send_snapshot(server).await;
        }
    }

    /// Streams the FSM snapshot to one peer over a replication-tagged
    /// connection: a header frame, then the length-prefixed record stream,
    /// then a status frame back.
    async fn send_snapshot(&self, server: Server) {
        let (header, data) = {
            let node = self.node.lock();
            let (header, snapshot) = match node.snapshot_for_peer() {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("snapshot for {} unavailable: {err}", server.id);
                    return;
                }
            };
            let mut data = Vec::with_capacity(snapshot.len() as usize);
            if let Err(err) = snapshot.persist(&mut data) {
                warn!("snapshot capture failed: {err}");
                return;
            }
            (header, data)
        };

        info!(
            "sending snapshot through index {} to {}",
            header.last_included_index, server.id
        );
        let result = async {
            let mut conn = self.layer.dial(&server.addr, STREAM_TAG).await?;
            write_frame(&mut conn, 0, &header.encode_to_vec()).await?;
            use tokio::io::AsyncWriteExt;
            conn.write_all(&data).await?;
            conn.flush().await?;
            let (status, payload) = read_frame(&mut conn).await?;
            if status != STATUS_OK {
                return Err(crate::error::Error::Protocol(
                    String::from_utf8_lossy(&payload).into_owned(),
                ));
            }
            Ok(())
        };
        match timeout(self.config.apply_timeout, result).await {
            Ok(Ok(())) => {
                let mut node = self.node.lock();
                if let Err(err) =
                    node.snapshot_installed_on(&server.id, header.last_included_index)
                {
                    warn!("snapshot bookkeeping failed: {err}");
                }
            }
            Ok(Err(err)) => warn!("snapshot to {} failed: {err}", server.id),
            Err(_) => warn!("snapshot to {} timed out", server.id),
        }
    }

    fn peer_list(&self, node: &RaftNode) -> Vec<(String, String)> {
        node.server_infos()
            .into_iter()
            .filter(|info| info.id != node.id())
            .map(|info| (info.id, info.rpc_addr))
            .collect()
    }

    /// Randomized between one and two election timeouts to keep
    /// candidates from splitting votes in lockstep.
    fn randomized_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout.max(Duration::from_millis(10));
        let extra = rand::thread_rng().gen_range(Duration::ZERO..base);
        // Followers fall back on the heartbeat timeout as the floor for
        // detecting a dead leader.
        self.config.heartbeat_timeout.max(base) + extra
    }
}
