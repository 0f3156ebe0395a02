//! Storage core of a distributed append-only commit log.
//!
//! Records are framed into segmented store files with memory-mapped
//! indexes ([`log::Log`]); a leader-based consensus layer replicates the
//! same log across a cluster ([`raft::DistributedLog`]), multiplexing
//! consensus RPCs and replication streams over one listener
//! ([`net::StreamLayer`]).

pub mod config;
pub mod error;
pub mod log;
pub mod net;
pub mod raft;
pub mod record;

pub use self::config::{Config, ConfigFile, RaftConfig, SegmentConfig};
pub use self::error::{Error, Result};
pub use self::log::Log;
pub use self::net::StreamLayer;
pub use self::raft::{DistributedLog, ServerInfo};
pub use self::record::Record;

/// The append/read contract the serving layer consumes.
#[async_trait::async_trait]
pub trait CommitLog: Send + Sync {
    async fn append(&self, record: Record) -> Result<u64>;
    fn read(&self, offset: u64) -> Result<Record>;
}

#[async_trait::async_trait]
impl CommitLog for Log {
    async fn append(&self, record: Record) -> Result<u64> {
        Log::append(self, record)
    }

    fn read(&self, offset: u64) -> Result<Record> {
        Log::read(self, offset)
    }
}

#[async_trait::async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> Result<u64> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> Result<Record> {
        DistributedLog::read(self, offset)
    }
}

/// The server-listing contract service discovery consumes.
pub trait ServerLister {
    fn get_servers(&self) -> Vec<ServerInfo>;
}

impl ServerLister for DistributedLog {
    fn get_servers(&self) -> Vec<ServerInfo> {
        DistributedLog::get_servers(self)
    }
}
