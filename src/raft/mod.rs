//! The replicated log: the segmented log behind a leader-based consensus
//! replica, with the shared stream transport.

pub mod event_loop;
pub mod fsm;
pub mod log_store;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod state;

pub use membership::Server;
pub use node::ServerState;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::log::Log;
use crate::net::RaftClient;
use crate::record::{encode_append_command, Record};
use self::event_loop::{LeaderContact, RaftEventLoop};
use self::fsm::{Fsm, SnapshotStore};
use self::node::RaftNode;

/// One row of the server listing exposed to service discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

/// A record log replicated across the cluster.
///
/// Appends go through consensus on the leader and resolve once the
/// command has committed and applied, at which point the returned offset
/// equals the consensus index of the command. Reads are served from the
/// local replica and are not linearizable.
pub struct DistributedLog {
    log: Arc<Log>,
    node: Arc<Mutex<RaftNode>>,
    client: RaftClient,
    snapshots: SnapshotStore,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    apply_timeout: Duration,
}

impl DistributedLog {
    /// Opens the record log at `{dir}/log` and the consensus state at
    /// `{dir}/raft`, installs the stream transport from the config, and
    /// starts the inbound server and the event loop. Must be called from
    /// within a tokio runtime.
    pub fn new(dir: impl AsRef<Path>, mut config: Config) -> Result<Self> {
        let layer = config
            .raft
            .stream_layer
            .take()
            .ok_or_else(|| Error::Config("raft.stream_layer is required".to_string()))?;
        let advertise_addr = layer.local_addr()?.to_string();

        let dir = dir.as_ref();
        let log = Arc::new(Log::open(dir.join("log"), config.segment.clone())?);
        let fsm = Fsm::new(Arc::clone(&log));
        let raft_dir = dir.join("raft");
        let snapshots = SnapshotStore::open(raft_dir.join("snapshots"))?;
        let node = Arc::new(Mutex::new(RaftNode::new(
            &raft_dir,
            &config,
            fsm,
            advertise_addr,
        )?));

        let client = RaftClient::new(layer.clone());
        let contact = LeaderContact::new();
        let wake = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let server = crate::net::server::RaftServer::new(
            Arc::clone(&node),
            layer.clone(),
            contact.clone(),
        );
        let server_task = tokio::spawn(server.run(shutdown_rx.clone()));

        let event_loop = RaftEventLoop::new(
            Arc::clone(&node),
            client.clone(),
            layer,
            config.raft.clone(),
            contact,
            Arc::clone(&wake),
        );
        let loop_task = tokio::spawn(event_loop.run(shutdown_rx));

        Ok(DistributedLog {
            log,
            node,
            client,
            snapshots,
            wake,
            shutdown,
            tasks: vec![server_task, loop_task],
            apply_timeout: config.raft.apply_timeout,
        })
    }

    /// Proposes a record through consensus and waits for it to commit and
    /// apply. Returns the assigned offset, which equals the consensus
    /// index of the command. Fails with `NotLeader` on followers and with
    /// `ApplyTimeout` when the window elapses; a timed-out proposal may
    /// still commit later.
    pub async fn append(&self, record: Record) -> Result<u64> {
        let command = encode_append_command(&record);
        let (index, committed) = self.node.lock().propose(command)?;
        self.wake.notify_one();

        let offset = match tokio::time::timeout(self.apply_timeout, committed).await {
            Ok(Ok(result)) => result?,
            // The proposal lost its leader; it may still commit under a
            // successor, so surface the timeout class.
            Ok(Err(_)) => return Err(Error::ApplyTimeout),
            Err(_) => return Err(Error::ApplyTimeout),
        };
        if offset != index {
            return Err(Error::corrupt(format!(
                "applied offset {offset} diverged from consensus index {index}"
            )));
        }
        Ok(offset)
    }

    /// Reads a record from the local replica.
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Leader-only: adds `id` at `addr` as a voter. Idempotent for an
    /// existing `(id, addr)` pair; a known id at a new address is
    /// re-added with the new address.
    pub fn join(&self, id: &str, addr: &str) -> Result<()> {
        self.node.lock().add_voter(id, addr)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Leader-only: removes the voter `id`.
    pub fn leave(&self, id: &str) -> Result<()> {
        self.node.lock().remove_server(id)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Polls with exponential backoff until some leader is observed.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(10);
        loop {
            if let Some(leader) = self.node.lock().current_leader() {
                return Ok(leader);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    /// Cluster view: every known server with its address and whether it is
    /// the leader as seen by this replica.
    pub fn get_servers(&self) -> Vec<ServerInfo> {
        self.node.lock().server_infos()
    }

    /// Whether this replica currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.node.lock().is_leader()
    }

    /// Writes a durable checkpoint of the applied state, then compacts the
    /// command log up to it.
    pub fn snapshot(&self) -> Result<PathBuf> {
        let (index, term, snapshot) = self.node.lock().prepare_checkpoint()?;
        let path = self.snapshots.save(index, term, snapshot)?;
        self.node.lock().finish_checkpoint(index, term)?;
        Ok(path)
    }

    /// Stops the server and event loops, drops peer connections, and
    /// closes both logs.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.client.close().await;
        self.node.lock().close()?;
        self.log.close()
    }
}

impl Drop for DistributedLog {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}
