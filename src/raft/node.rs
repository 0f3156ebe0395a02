//! Core consensus state machine: elections, log replication, commitment,
//! and membership bookkeeping. Networking and timing live in the event
//! loop and transport; this type is synchronous and driven under a lock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::raft::fsm::{Fsm, FsmSnapshot};
use crate::raft::log_store::LogStore;
use crate::raft::membership::{Membership, Server};
use crate::raft::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SnapshotHeader,
};
use crate::raft::state::RaftState;
use crate::raft::ServerInfo;

/// Volatile role of a replica. Always starts as follower; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Follower,
    Candidate,
    Leader,
}

/// Entries shipped per AppendEntries round.
const REPLICATION_BATCH: usize = 64;

pub struct RaftNode {
    id: String,
    advertise_addr: String,
    log: LogStore,
    state: RaftState,
    fsm: Fsm,
    membership: Membership,

    server_state: ServerState,
    current_leader: Option<String>,
    commit_index: Option<u64>,
    last_applied: Option<u64>,
    /// Leader-only: next entry index to send to each peer.
    next_index: HashMap<String, u64>,
    /// Leader-only: highest entry index known replicated on each peer.
    match_index: HashMap<String, Option<u64>>,
    /// Leader-only: last time each peer answered an RPC.
    peer_contact: HashMap<String, Instant>,
    /// Candidate-only: votes gathered for the current election.
    votes_received: HashSet<String>,
    election_term: u64,
    /// Proposals waiting for their command to commit and apply.
    pending: HashMap<u64, oneshot::Sender<Result<u64>>>,
}

impl RaftNode {
    /// Opens the consensus state under `raft_dir`: the command log, the
    /// durable term/vote state, and the persisted membership. With
    /// `bootstrap` set and no recorded membership, the node seeds itself
    /// as the single voter.
    pub fn new(
        raft_dir: &Path,
        config: &Config,
        fsm: Fsm,
        advertise_addr: String,
    ) -> Result<Self> {
        std::fs::create_dir_all(raft_dir)?;
        let log = LogStore::open(raft_dir.join("log"), config.segment.clone())?;
        let state = RaftState::open(raft_dir.join("state"))?;
        let mut membership = Membership::open(raft_dir.join("membership.json"))?;

        let id = config.raft.local_id.clone();
        if config.raft.bootstrap && membership.is_empty() {
            membership.add_voter(&id, &advertise_addr)?;
            info!("node {id} bootstrapped as the single voter at {advertise_addr}");
        }

        // Everything already in the record log was committed and applied
        // before the restart.
        let last_applied = fsm.applied_up_to();

        Ok(RaftNode {
            id,
            advertise_addr,
            log,
            state,
            fsm,
            membership,
            server_state: ServerState::Follower,
            current_leader: None,
            commit_index: last_applied,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            peer_contact: HashMap::new(),
            votes_received: HashSet::new(),
            election_term: 0,
            pending: HashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_state(&self) -> ServerState {
        self.server_state
    }

    pub fn is_leader(&self) -> bool {
        self.server_state == ServerState::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.state.current_term()
    }

    pub fn current_leader(&self) -> Option<String> {
        self.current_leader.clone()
    }

    /// Address of the last known leader, for redirection hints.
    pub fn leader_addr(&self) -> Option<String> {
        let leader = self.current_leader.as_deref()?;
        if leader == self.id {
            return Some(self.advertise_addr.clone());
        }
        self.membership.get(leader).map(|server| server.addr.clone())
    }

    /// Cluster view for the server-listing contract.
    pub fn server_infos(&self) -> Vec<ServerInfo> {
        self.membership
            .servers()
            .iter()
            .map(|server| ServerInfo {
                id: server.id.clone(),
                rpc_addr: server.addr.clone(),
                is_leader: self.current_leader.as_deref() == Some(server.id.as_str()),
            })
            .collect()
    }

    // ---- client-facing operations -------------------------------------

    /// Leader-only: appends a command to the replicated log and registers
    /// a waiter resolved when the command commits and applies.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(u64, oneshot::Receiver<Result<u64>>)> {
        if self.server_state != ServerState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        let term = self.state.current_term();
        let index = self.log.append_command(term, command)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(index, tx);
        // A single-voter cluster commits on its own appends.
        self.try_advance_commit()?;
        Ok((index, rx))
    }

    /// Leader-only: adds a voter. Adding an existing `(id, addr)` voter is
    /// a no-op; the same id at a new address is replaced.
    pub fn add_voter(&mut self, id: &str, addr: &str) -> Result<()> {
        if self.server_state != ServerState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        if self.membership.add_voter(id, addr)? {
            info!("leader {} added voter {id} at {addr}", self.id);
            self.next_index.insert(id.to_string(), self.next_log_index());
            self.match_index.insert(id.to_string(), None);
            // Grace period before the new voter counts against the lease.
            self.peer_contact.insert(id.to_string(), Instant::now());
        }
        Ok(())
    }

    /// Leader-only: removes a server from the cluster.
    pub fn remove_server(&mut self, id: &str) -> Result<()> {
        if self.server_state != ServerState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        if self.membership.remove(id)? {
            info!("leader {} removed server {id}", self.id);
            self.next_index.remove(id);
            self.match_index.remove(id);
            self.peer_contact.remove(id);
            if id == self.id {
                self.abdicate();
            }
        }
        Ok(())
    }

    // ---- inbound RPCs -------------------------------------------------

    pub fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        // Candidates outside the membership cannot pull the cluster to a
        // higher term; a removed node electing itself stays ignored.
        if !self.membership.is_empty() && !self.membership.is_voter(&request.candidate_id) {
            debug!(
                "node {} denied vote to non-member {}",
                self.id, request.candidate_id
            );
            return Ok(RequestVoteResponse::deny(self.state.current_term()));
        }

        if request.term < self.state.current_term() {
            return Ok(RequestVoteResponse::deny(self.state.current_term()));
        }
        if request.term > self.state.current_term() {
            self.step_down(request.term)?;
        }
        let current_term = self.state.current_term();

        let ours = self.last_log_position()?;
        let candidate_up_to_date = match (ours, request.last_log_index) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((our_index, our_term)), Some(their_index)) => {
                request.last_log_term > our_term
                    || (request.last_log_term == our_term && their_index >= our_index)
            }
        };

        if candidate_up_to_date && self.state.vote_for(&request.candidate_id)? {
            debug!(
                "node {} granted vote to {} for term {current_term}",
                self.id, request.candidate_id
            );
            Ok(RequestVoteResponse::grant(current_term))
        } else {
            Ok(RequestVoteResponse::deny(current_term))
        }
    }

    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.term < self.state.current_term() {
            return Ok(AppendEntriesResponse::failure(
                self.state.current_term(),
                self.last_index(),
            ));
        }
        if request.term > self.state.current_term() {
            self.step_down(request.term)?;
        } else if self.server_state != ServerState::Follower {
            self.server_state = ServerState::Follower;
            self.votes_received.clear();
        }
        let current_term = self.state.current_term();

        if self.current_leader.as_deref() != Some(request.leader_id.as_str()) {
            info!(
                "node {} following leader {} for term {current_term}",
                self.id, request.leader_id
            );
        }
        self.current_leader = Some(request.leader_id.clone());

        // Adopt the membership the leader rides on its heartbeats.
        if !request.servers.is_empty() {
            let servers: Vec<Server> = request.servers.iter().cloned().map(Into::into).collect();
            self.membership.replace_all(servers)?;
        }

        if !self.matches_previous_entry(&request)? {
            return Ok(AppendEntriesResponse::failure(
                current_term,
                self.last_index(),
            ));
        }

        for entry in &request.entries {
            let next = self.next_log_index();
            if entry.index < next {
                match self.log.term_of(entry.index) {
                    Ok(term) if term == entry.term => {
                        // Already replicated.
                    }
                    Ok(_) => {
                        warn!(
                            "node {} truncating conflicting suffix from index {}",
                            self.id, entry.index
                        );
                        self.log.truncate_back(entry.index)?;
                        self.log.store_log(entry)?;
                    }
                    // Covered by an installed snapshot.
                    Err(Error::OffsetOutOfRange { .. }) => {}
                    Err(err) => return Err(err),
                }
            } else if entry.index == next {
                self.log.store_log(entry)?;
            } else {
                return Ok(AppendEntriesResponse::failure(
                    current_term,
                    self.last_index(),
                ));
            }
        }

        if let Some(leader_commit) = request.leader_commit {
            if let Some(last) = self.last_index() {
                let new_commit = leader_commit.min(last);
                if self.commit_index.map_or(true, |commit| new_commit > commit) {
                    self.commit_index = Some(new_commit);
                    self.apply_committed()?;
                }
            }
        }

        Ok(AppendEntriesResponse::success(
            current_term,
            self.last_index(),
        ))
    }

    /// Installs a streamed snapshot. Returns false when the snapshot is
    /// stale and was ignored.
    pub fn install_snapshot(&mut self, header: &SnapshotHeader, stream: &[u8]) -> Result<bool> {
        if header.term < self.state.current_term() {
            return Ok(false);
        }
        if header.term > self.state.current_term() {
            self.step_down(header.term)?;
        }
        self.server_state = ServerState::Follower;
        self.current_leader = Some(header.leader_id.clone());

        if self
            .last_applied
            .is_some_and(|applied| applied >= header.last_included_index)
        {
            return Ok(false);
        }

        info!(
            "node {} installing snapshot through index {}",
            self.id, header.last_included_index
        );
        self.fsm.restore(&mut &stream[..])?;
        self.log.reset_to(header.last_included_index + 1)?;
        self.state
            .set_snapshot_marker(header.last_included_index, header.last_included_term)?;
        self.commit_index = Some(header.last_included_index);
        self.last_applied = Some(header.last_included_index);
        Ok(true)
    }

    // ---- elections ----------------------------------------------------

    /// Moves to candidate and produces the vote request to broadcast.
    /// Returns `None` when this node cannot campaign (it knows no
    /// membership, or is not a voter in it).
    pub fn start_election(&mut self) -> Result<Option<RequestVoteRequest>> {
        if self.membership.is_empty() || !self.membership.is_voter(&self.id) {
            return Ok(None);
        }

        let term = self.state.current_term() + 1;
        self.state.advance_term(term)?;
        self.server_state = ServerState::Candidate;
        self.election_term = term;
        self.current_leader = None;
        self.votes_received.clear();

        if !self.state.vote_for(&self.id)? {
            return Ok(None);
        }
        self.votes_received.insert(self.id.clone());
        info!("node {} starting election for term {term}", self.id);

        let last = self.last_log_position()?;
        Ok(Some(RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: last.map(|(index, _)| index),
            last_log_term: last.map(|(_, term)| term).unwrap_or(0),
        }))
    }

    /// Records one vote response; returns true when the election is won.
    pub fn handle_vote_response(
        &mut self,
        from: &str,
        response: RequestVoteResponse,
    ) -> Result<bool> {
        if response.term > self.state.current_term() {
            self.step_down(response.term)?;
            return Ok(false);
        }
        if self.server_state != ServerState::Candidate || response.term != self.election_term {
            return Ok(false);
        }
        if response.vote_granted {
            self.votes_received.insert(from.to_string());
        }
        if self.election_won() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the gathered votes form a quorum. Meaningful for the
    /// single-voter cluster as well, where a self-vote suffices.
    pub fn election_won(&self) -> bool {
        self.server_state == ServerState::Candidate
            && self.votes_received.len() >= self.membership.majority()
    }

    pub fn become_leader(&mut self) {
        let term = self.state.current_term();
        self.server_state = ServerState::Leader;
        self.current_leader = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.next_log_index();
        self.next_index.clear();
        self.match_index.clear();
        self.peer_contact.clear();
        let now = Instant::now();
        for server in self.membership.servers() {
            if server.id != self.id {
                self.next_index.insert(server.id.clone(), next);
                self.match_index.insert(server.id.clone(), None);
                self.peer_contact.insert(server.id.clone(), now);
            }
        }

        info!("node {} became leader for term {term}", self.id);
    }

    // ---- replication (leader side) ------------------------------------

    /// Builds one replication round: an AppendEntries request per peer,
    /// plus the peers so far behind they need a snapshot instead.
    pub fn replication_round(&self) -> Result<(Vec<(Server, AppendEntriesRequest)>, Vec<Server>)> {
        if self.server_state != ServerState::Leader {
            return Ok((Vec::new(), Vec::new()));
        }

        let term = self.state.current_term();
        let last_index = self.last_index();
        let servers: Vec<crate::raft::rpc::ServerEntry> =
            self.membership.servers().iter().map(Into::into).collect();
        let mut requests = Vec::new();
        let mut snapshot_peers = Vec::new();

        for server in self.membership.servers() {
            if server.id == self.id {
                continue;
            }
            let next = self
                .next_index
                .get(&server.id)
                .copied()
                .unwrap_or_else(|| self.next_log_index());

            if self.peer_needs_snapshot(next) {
                snapshot_peers.push(server.clone());
                continue;
            }

            let (prev_log_index, prev_log_term) = if next == 0 {
                (None, 0)
            } else {
                (Some(next - 1), self.term_at(next - 1)?)
            };

            let entries = match last_index {
                Some(last) if next <= last => self.log.entries_from(next, REPLICATION_BATCH)?,
                _ => Vec::new(),
            };

            requests.push((
                server.clone(),
                AppendEntriesRequest {
                    term,
                    leader_id: self.id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: self.commit_index,
                    servers: servers.clone(),
                },
            ));
        }

        Ok((requests, snapshot_peers))
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: &str,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        if response.term > self.state.current_term() {
            info!(
                "node {} stepping down: higher term {} from {from}",
                self.id, response.term
            );
            return self.step_down(response.term);
        }
        if self.server_state != ServerState::Leader || response.term < self.state.current_term() {
            return Ok(());
        }

        self.peer_contact.insert(from.to_string(), Instant::now());

        if response.success {
            let replicated = if request.entries.is_empty() {
                request.prev_log_index
            } else {
                request.entries.last().map(|entry| entry.index)
            };
            let known = self.match_index.entry(from.to_string()).or_insert(None);
            if replicated > *known {
                *known = replicated;
            }
            if let Some(matched) = replicated {
                self.next_index.insert(from.to_string(), matched + 1);
            }
            self.try_advance_commit()?;
        } else {
            // Converge on the follower's actual tail instead of probing
            // back one index per round.
            let fallback = response
                .last_log_index
                .map(|last| last + 1)
                .unwrap_or(0);
            let current = self
                .next_index
                .get(from)
                .copied()
                .unwrap_or_else(|| self.next_log_index());
            self.next_index
                .insert(from.to_string(), fallback.min(current.saturating_sub(1)));
        }
        Ok(())
    }

    /// Records a successfully installed snapshot on a peer so replication
    /// resumes from the entry after it.
    pub fn snapshot_installed_on(&mut self, peer: &str, last_included: u64) -> Result<()> {
        if self.server_state != ServerState::Leader {
            return Ok(());
        }
        self.peer_contact.insert(peer.to_string(), Instant::now());
        let known = self.match_index.entry(peer.to_string()).or_insert(None);
        if Some(last_included) > *known {
            *known = Some(last_included);
        }
        self.next_index.insert(peer.to_string(), last_included + 1);
        self.try_advance_commit()
    }

    /// Steps down when a majority of voters has been silent longer than
    /// the lease. Returns whether the node is still leader.
    pub fn check_leader_lease(&mut self, lease: Duration) -> bool {
        if self.server_state != ServerState::Leader {
            return false;
        }
        if self.membership.voter_count() <= 1 {
            return true;
        }
        let fresh = 1 + self
            .membership
            .servers()
            .iter()
            .filter(|server| server.voter && server.id != self.id)
            .filter(|server| {
                self.peer_contact
                    .get(&server.id)
                    .is_some_and(|at| at.elapsed() < lease)
            })
            .count();
        if fresh < self.membership.majority() {
            warn!(
                "node {} lost contact with a majority, abandoning leadership",
                self.id
            );
            self.abdicate();
            return false;
        }
        true
    }

    /// Header and data stream for bringing a lagging peer up via the
    /// replication stream.
    pub fn snapshot_for_peer(&self) -> Result<(SnapshotHeader, FsmSnapshot)> {
        let applied = self
            .last_applied
            .ok_or_else(|| Error::corrupt("no applied state to snapshot"))?;
        Ok((
            SnapshotHeader {
                term: self.state.current_term(),
                leader_id: self.id.clone(),
                last_included_index: applied,
                last_included_term: self.term_at(applied)?,
            },
            self.fsm.snapshot(),
        ))
    }

    /// First phase of a checkpoint: capture the applied state.
    pub fn prepare_checkpoint(&self) -> Result<(u64, u64, FsmSnapshot)> {
        let applied = self
            .last_applied
            .ok_or_else(|| Error::corrupt("no applied state to snapshot"))?;
        Ok((applied, self.term_at(applied)?, self.fsm.snapshot()))
    }

    /// Second phase: once the snapshot is durable, compact the command log
    /// and record the marker.
    pub fn finish_checkpoint(&mut self, index: u64, term: u64) -> Result<()> {
        self.state.set_snapshot_marker(index, term)?;
        self.log.delete_range(0, index)
    }

    /// Flushes and closes the command log.
    pub fn close(&self) -> Result<()> {
        self.log.close()
    }

    // ---- internals ----------------------------------------------------

    fn matches_previous_entry(&self, request: &AppendEntriesRequest) -> Result<bool> {
        let Some(prev_index) = request.prev_log_index else {
            return Ok(true);
        };
        if let Some((snap_index, snap_term)) = self.state.snapshot_marker() {
            if prev_index < snap_index {
                return Ok(true);
            }
            if prev_index == snap_index {
                return Ok(snap_term == request.prev_log_term);
            }
        }
        match self.log.term_of(prev_index) {
            Ok(term) => Ok(term == request.prev_log_term),
            Err(Error::OffsetOutOfRange { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn try_advance_commit(&mut self) -> Result<()> {
        if self.server_state != ServerState::Leader {
            return Ok(());
        }
        let Some(last) = self.log.last_index() else {
            return Ok(());
        };
        let current_term = self.state.current_term();
        let start = match self.commit_index {
            Some(commit) => commit + 1,
            None => self.log.first_index().unwrap_or(0),
        };

        let mut new_commit = self.commit_index;
        for candidate in start..=last {
            // Only entries of the current term commit by counting.
            if self.term_at(candidate)? != current_term {
                continue;
            }
            let replicas = 1 + self
                .membership
                .servers()
                .iter()
                .filter(|server| server.voter && server.id != self.id)
                .filter(|server| {
                    self.match_index
                        .get(&server.id)
                        .copied()
                        .flatten()
                        .is_some_and(|matched| matched >= candidate)
                })
                .count();
            if replicas >= self.membership.majority() {
                new_commit = Some(candidate);
            }
        }

        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<()> {
        while let Some(commit) = self.commit_index {
            let next = self.last_applied.map(|applied| applied + 1).unwrap_or(0);
            if next > commit {
                break;
            }
            let entry = self.log.get_log(next)?;
            match self.fsm.apply(&entry) {
                Ok(offset) => {
                    self.last_applied = Some(next);
                    if let Some(waiter) = self.pending.remove(&next) {
                        let _ = waiter.send(Ok(offset));
                    }
                }
                Err(err) => {
                    let reason = format!("apply failed at index {next}: {err}");
                    if let Some(waiter) = self.pending.remove(&next) {
                        let _ = waiter.send(Err(err));
                    }
                    return Err(Error::corrupt(reason));
                }
            }
        }
        Ok(())
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        self.state.advance_term(term)?;
        self.server_state = ServerState::Follower;
        self.current_leader = None;
        self.votes_received.clear();
        self.fail_pending();
        Ok(())
    }

    fn abdicate(&mut self) {
        self.server_state = ServerState::Follower;
        self.current_leader = None;
        self.votes_received.clear();
        self.fail_pending();
    }

    /// Outstanding proposals lose their leader; their commands may still
    /// commit under a successor, so waiters see a timeout-class failure
    /// rather than a definite loss.
    fn fail_pending(&mut self) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(Error::ApplyTimeout));
        }
    }

    fn peer_needs_snapshot(&self, next: u64) -> bool {
        if let Some((snap_index, _)) = self.state.snapshot_marker() {
            if next <= snap_index {
                return true;
            }
        }
        match self.log.first_index() {
            Some(first) => next < first,
            None => false,
        }
    }

    fn term_at(&self, index: u64) -> Result<u64> {
        match self.log.term_of(index) {
            Ok(term) => Ok(term),
            Err(Error::OffsetOutOfRange { .. }) => {
                if let Some((snap_index, snap_term)) = self.state.snapshot_marker() {
                    if index == snap_index {
                        return Ok(snap_term);
                    }
                }
                Err(Error::corrupt(format!(
                    "no term recorded for command index {index}"
                )))
            }
            Err(err) => Err(err),
        }
    }

    /// Index and term of the newest command, falling back to the snapshot
    /// marker when the command log is empty.
    fn last_log_position(&self) -> Result<Option<(u64, u64)>> {
        if let Some(last) = self.log.last_index() {
            return Ok(Some((last, self.term_at(last)?)));
        }
        Ok(self.state.snapshot_marker())
    }

    fn last_index(&self) -> Option<u64> {
        self.log
            .last_index()
            .or(self.state.snapshot_marker().map(|(index, _)| index))
    }

    fn next_log_index(&self) -> u64 {
        self.last_index().map(|last| last + 1).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::log::Log;
    use crate::raft::rpc::CommandEntry;
    use crate::record::{encode_append_command, Record};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        node: RaftNode,
        log: Arc<Log>,
        _dir: TempDir,
    }

    fn fixture(id: &str, bootstrap: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.segment = SegmentConfig {
            max_store_bytes: 4096,
            max_index_bytes: 4096,
            initial_offset: 0,
        };
        config.raft.local_id = id.to_string();
        config.raft.bootstrap = bootstrap;

        let log = Arc::new(Log::open(dir.path().join("log"), config.segment.clone()).unwrap());
        let fsm = Fsm::new(Arc::clone(&log));
        let node = RaftNode::new(
            &dir.path().join("raft"),
            &config,
            fsm,
            format!("127.0.0.1:7{id}00"),
        )
        .unwrap();
        Fixture {
            node,
            log,
            _dir: dir,
        }
    }

    fn command(value: &[u8]) -> Vec<u8> {
        encode_append_command(&Record::new(value.to_vec()))
    }

    fn elect(node: &mut RaftNode) {
        node.start_election().unwrap().unwrap();
        assert!(node.election_won());
        node.become_leader();
    }

    #[test]
    fn test_bootstrap_single_node_elects_and_commits() {
        let mut fx = fixture("0", true);
        elect(&mut fx.node);
        assert!(fx.node.is_leader());

        let (index, mut rx) = fx.node.propose(command(b"hello")).unwrap();
        assert_eq!(index, 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 0);

        // The record landed in the record log at the command's index.
        assert_eq!(fx.log.read(0).unwrap().value, b"hello");
    }

    #[test]
    fn test_propose_on_follower_is_rejected() {
        let mut fx = fixture("1", false);
        match fx.node.propose(command(b"nope")) {
            Err(Error::NotLeader { .. }) => {}
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn test_follower_without_membership_cannot_campaign() {
        let mut fx = fixture("1", false);
        assert!(fx.node.start_election().unwrap().is_none());
        assert_eq!(fx.node.server_state(), ServerState::Follower);
    }

    #[test]
    fn test_replication_to_follower_applies_on_commit() {
        let mut leader = fixture("0", true);
        elect(&mut leader.node);
        leader.node.add_voter("1", "127.0.0.1:7100").unwrap();
        leader.node.add_voter("2", "127.0.0.1:7200").unwrap();

        let (_, _rx) = leader.node.propose(command(b"hello")).unwrap();
        let (requests, snapshots) = leader.node.replication_round().unwrap();
        assert!(snapshots.is_empty());
        assert_eq!(requests.len(), 2);
        let request = requests
            .iter()
            .find(|(server, _)| server.id == "1")
            .map(|(_, request)| request.clone())
            .unwrap();
        assert_eq!(request.entries.len(), 1);
        assert_eq!(request.prev_log_index, None);
        assert_eq!(request.servers.len(), 3);

        // Follower accepts the entries and learns the membership.
        let mut follower = fixture("1", false);
        let response = follower.node.handle_append_entries(request.clone()).unwrap();
        assert!(response.success);
        assert_eq!(response.last_log_index, Some(0));
        assert_eq!(follower.node.current_leader(), Some("0".to_string()));
        assert!(follower.node.leader_addr().is_some());

        // Leader counts the ack and commits; nothing applied on the
        // follower until the commit index reaches it.
        leader
            .node
            .handle_append_entries_response("1", &request, response)
            .unwrap();
        let (requests, _) = leader.node.replication_round().unwrap();
        let heartbeat = requests
            .iter()
            .find(|(server, _)| server.id == "1")
            .map(|(_, request)| request.clone())
            .unwrap();
        assert_eq!(heartbeat.leader_commit, Some(0));

        follower.node.handle_append_entries(heartbeat).unwrap();
        assert_eq!(follower.log.read(0).unwrap().value, b"hello");
    }

    #[test]
    fn test_conflicting_suffix_is_replaced() {
        let mut follower = fixture("1", false);
        // Old leader replicated two entries at term 1.
        follower
            .node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "0".to_string(),
                prev_log_index: None,
                prev_log_term: 0,
                entries: vec![
                    CommandEntry {
                        index: 0,
                        term: 1,
                        command: command(b"keep"),
                    },
                    CommandEntry {
                        index: 1,
                        term: 1,
                        command: command(b"replace me"),
                    },
                ],
                leader_commit: None,
                servers: vec![],
            })
            .unwrap();

        // New leader at term 2 disagrees about index 1.
        let response = follower
            .node
            .handle_append_entries(AppendEntriesRequest {
                term: 2,
                leader_id: "2".to_string(),
                prev_log_index: Some(0),
                prev_log_term: 1,
                entries: vec![CommandEntry {
                    index: 1,
                    term: 2,
                    command: command(b"replacement"),
                }],
                leader_commit: Some(1),
                servers: vec![],
            })
            .unwrap();
        assert!(response.success);
        assert_eq!(follower.log.read(1).unwrap().value, b"replacement");
    }

    #[test]
    fn test_append_entries_rejects_missing_previous() {
        let mut follower = fixture("1", false);
        let response = follower
            .node
            .handle_append_entries(AppendEntriesRequest {
                term: 1,
                leader_id: "0".to_string(),
                prev_log_index: Some(4),
                prev_log_term: 1,
                entries: vec![],
                leader_commit: None,
                servers: vec![],
            })
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.last_log_index, None);
    }

    #[test]
    fn test_non_member_candidate_is_ignored() {
        let mut fx = fixture("0", true);
        elect(&mut fx.node);
        let term = fx.node.current_term();

        let response = fx
            .node
            .handle_request_vote(RequestVoteRequest {
                term: term + 10,
                candidate_id: "99".to_string(),
                last_log_index: Some(100),
                last_log_term: term + 10,
            })
            .unwrap();
        assert!(!response.vote_granted);
        // The outsider's term did not disturb ours.
        assert_eq!(fx.node.current_term(), term);
        assert!(fx.node.is_leader());
    }

    #[test]
    fn test_vote_denied_for_stale_log() {
        let mut voter = fixture("0", true);
        elect(&mut voter.node);
        voter.node.add_voter("1", "127.0.0.1:7100").unwrap();
        let (_, _rx) = voter.node.propose(command(b"fresh")).unwrap();
        let term = voter.node.current_term();

        // A member whose log is empty asks for a vote at a newer term.
        let response = voter
            .node
            .handle_request_vote(RequestVoteRequest {
                term: term + 1,
                candidate_id: "1".to_string(),
                last_log_index: None,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!response.vote_granted);
        // But the newer term was adopted and leadership abandoned.
        assert_eq!(voter.node.current_term(), term + 1);
        assert!(!voter.node.is_leader());
    }

    #[test]
    fn test_remove_server_stops_replicating_to_it() {
        let mut leader = fixture("0", true);
        elect(&mut leader.node);
        leader.node.add_voter("1", "127.0.0.1:7100").unwrap();
        leader.node.add_voter("2", "127.0.0.1:7200").unwrap();

        leader.node.remove_server("1").unwrap();
        let (requests, _) = leader.node.replication_round().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.id, "2");
        assert_eq!(leader.node.server_infos().len(), 2);
    }

    #[test]
    fn test_lease_expiry_steps_down() {
        let mut leader = fixture("0", true);
        elect(&mut leader.node);
        leader.node.add_voter("1", "127.0.0.1:7100").unwrap();
        leader.node.add_voter("2", "127.0.0.1:7200").unwrap();

        // Nobody has answered since becoming leader; a zero lease lapses
        // immediately.
        assert!(!leader.node.check_leader_lease(Duration::from_secs(0)));
        assert!(!leader.node.is_leader());
    }

    #[test]
    fn test_snapshot_round_trip_between_nodes() {
        let mut leader = fixture("0", true);
        elect(&mut leader.node);
        for i in 0..3 {
            let (_, mut rx) = leader
                .node
                .propose(command(format!("record {i}").as_bytes()))
                .unwrap();
            rx.try_recv().unwrap().unwrap();
        }

        let (header, snapshot) = leader.node.snapshot_for_peer().unwrap();
        assert_eq!(header.last_included_index, 2);
        let mut stream = Vec::new();
        snapshot.persist(&mut stream).unwrap();

        let mut follower = fixture("1", false);
        assert!(follower.node.install_snapshot(&header, &stream).unwrap());
        assert_eq!(follower.log.read(2).unwrap().value, b"record 2");

        // Entries after the snapshot chain off the marker.
        let response = follower
            .node
            .handle_append_entries(AppendEntriesRequest {
                term: header.term,
                leader_id: "0".to_string(),
                prev_log_index: Some(2),
                prev_log_term: header.last_included_term,
                entries: vec![CommandEntry {
                    index: 3,
                    term: header.term,
                    command: command(b"after snapshot"),
                }],
                leader_commit: Some(3),
                servers: vec![],
            })
            .unwrap();
        assert!(response.success);
        assert_eq!(follower.log.read(3).unwrap().value, b"after snapshot");
    }

    #[test]
    fn test_checkpoint_compacts_and_flags_lagging_peer() {
        let mut leader = fixture("0", true);
        elect(&mut leader.node);
        for i in 0..4 {
            let (_, mut rx) = leader
                .node
                .propose(command(format!("record {i}").as_bytes()))
                .unwrap();
            rx.try_recv().unwrap().unwrap();
        }

        let (index, term, snapshot) = leader.node.prepare_checkpoint().unwrap();
        let mut sink = Vec::new();
        snapshot.persist(&mut sink).unwrap();
        leader.node.finish_checkpoint(index, term).unwrap();

        // A brand-new peer now needs the snapshot path.
        leader.node.add_voter("1", "127.0.0.1:7100").unwrap();
        leader.node.next_index.insert("1".to_string(), 0);
        let (_, snapshot_peers) = leader.node.replication_round().unwrap();
        assert_eq!(snapshot_peers.len(), 1);
        assert_eq!(snapshot_peers[0].id, "1");
    }
}
