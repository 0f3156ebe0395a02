//! Cluster membership: the voter set and its persistence.
//!
//! Membership changes do not travel through the command log; the leader
//! mutates its set on `join`/`leave` and followers adopt the copy carried
//! on heartbeats. Each replica persists its latest view so a restarted
//! node knows its peers before the first heartbeat arrives.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raft::rpc::ServerEntry;

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub addr: String,
    pub voter: bool,
}

/// The replica's current view of the cluster.
#[derive(Debug)]
pub struct Membership {
    servers: Vec<Server>,
    path: PathBuf,
}

impl Membership {
    /// Loads the persisted membership at `path`, or starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let servers = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| Error::corrupt(format!("membership file: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Membership { servers, path })
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.get(id).is_some_and(|server| server.voter)
    }

    pub fn voter_count(&self) -> usize {
        self.servers.iter().filter(|server| server.voter).count()
    }

    /// Votes needed for a quorum.
    pub fn majority(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Adds a voter. A no-op when `(id, addr)` is already a voter; an
    /// existing id with a different address is replaced.
    pub fn add_voter(&mut self, id: &str, addr: &str) -> Result<bool> {
        if let Some(existing) = self.get(id) {
            if existing.addr == addr && existing.voter {
                return Ok(false);
            }
            self.servers.retain(|server| server.id != id);
        }
        self.servers.push(Server {
            id: id.to_string(),
            addr: addr.to_string(),
            voter: true,
        });
        self.persist()?;
        Ok(true)
    }

    /// Removes a server. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.servers.len();
        self.servers.retain(|server| server.id != id);
        if self.servers.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Adopts the membership carried on a heartbeat.
    pub fn replace_all(&mut self, servers: Vec<Server>) -> Result<()> {
        if self.servers == servers {
            return Ok(());
        }
        self.servers = servers;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.servers)
            .map_err(|err| Error::corrupt(format!("membership encode: {err}")))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl From<&Server> for ServerEntry {
    fn from(server: &Server) -> Self {
        ServerEntry {
            id: server.id.clone(),
            addr: server.addr.clone(),
            voter: server.voter,
        }
    }
}

impl From<ServerEntry> for Server {
    fn from(entry: ServerEntry) -> Self {
        Server {
            id: entry.id,
            addr: entry.addr,
            voter: entry.voter,
        }
    }
}
