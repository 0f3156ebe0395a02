//! Error types shared across the storage and replication layers.

use std::io;

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for commit log operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for an offset the log no longer contains or has not
    /// yet produced.
    #[error("offset {requested} out of range (log covers {lowest}..={highest})")]
    OffsetOutOfRange {
        /// Offset that was requested.
        requested: u64,
        /// Lowest offset currently held.
        lowest: u64,
        /// Highest offset currently held.
        highest: u64,
    },

    /// The index has no entry satisfying the read.
    #[error("index has no entry for the requested position")]
    IndexEmpty,

    /// The index has no room for another entry.
    #[error("index is full")]
    IndexFull,

    /// A write was attempted on a replica that is not the leader.
    #[error("not the leader{}", leader_hint(.leader_addr))]
    NotLeader {
        /// Last known leader address, for client redirection.
        leader_addr: Option<String>,
    },

    /// Consensus did not commit the proposal within the apply window.
    #[error("apply timed out before the proposal committed")]
    ApplyTimeout,

    /// A bounded wait elapsed without the condition being met.
    #[error("timed out")]
    Timeout,

    /// Framing or length check failed on read or restore.
    #[error("corrupt data: {reason}")]
    Corrupt {
        /// What failed to validate.
        reason: String,
    },

    /// A wire message failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The remote peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn leader_hint(addr: &Option<String>) -> String {
    match addr {
        Some(addr) => format!(" (leader at {addr})"),
        None => String::new(),
    }
}

impl Error {
    /// Corrupt-data constructor used by framing checks.
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }
}
