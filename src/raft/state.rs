//! Durable per-replica consensus state, kept in a small memory-mapped file.
//!
//! File layout (big-endian):
//!
//! ```text
//! magic (4) | version (4) | current term (8) | snapshot index (8)
//! | snapshot term (8) | voted-for length (4) | voted-for bytes (64)
//! ```
//!
//! The snapshot index/term pair marks the last command covered by an
//! installed snapshot; `u64::MAX` in the index slot means none. Volatile
//! role state (follower/candidate/leader) is never persisted.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, Result};

const MAGIC: u32 = 0x5246_5354;
const VERSION: u32 = 1;

const TERM_AT: usize = 8;
const SNAPSHOT_INDEX_AT: usize = 16;
const SNAPSHOT_TERM_AT: usize = 24;
const VOTED_LEN_AT: usize = 32;
const VOTED_BYTES_AT: usize = 36;
const MAX_ID_LEN: usize = 64;
const STATE_FILE_LEN: u64 = (VOTED_BYTES_AT + MAX_ID_LEN) as u64;

const NO_SNAPSHOT: u64 = u64::MAX;

/// Persistent term, vote, and snapshot-marker state.
#[derive(Debug)]
pub struct RaftState {
    mmap: MmapMut,
}

impl RaftState {
    /// Opens (or creates) the state file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let fresh = file.metadata()?.len() == 0;
        file.set_len(STATE_FILE_LEN)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut state = RaftState { mmap };
        if fresh {
            state.put_u32(0, MAGIC);
            state.put_u32(4, VERSION);
            state.put_u64(SNAPSHOT_INDEX_AT, NO_SNAPSHOT);
            state.mmap.flush()?;
        } else {
            state.validate_header()?;
        }
        Ok(state)
    }

    pub fn current_term(&self) -> u64 {
        self.get_u64(TERM_AT)
    }

    /// Moves to a newer term, clearing the recorded vote.
    pub fn advance_term(&mut self, term: u64) -> Result<()> {
        self.put_u64(TERM_AT, term);
        self.put_u32(VOTED_LEN_AT, 0);
        Ok(self.mmap.flush()?)
    }

    pub fn voted_for(&self) -> Option<String> {
        let len = self.get_u32(VOTED_LEN_AT) as usize;
        if len == 0 {
            return None;
        }
        let bytes = &self.mmap[VOTED_BYTES_AT..VOTED_BYTES_AT + len.min(MAX_ID_LEN)];
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Records a vote for `candidate` in the current term. Returns false
    /// without writing when a different vote is already recorded.
    pub fn vote_for(&mut self, candidate: &str) -> Result<bool> {
        match self.voted_for() {
            Some(existing) => Ok(existing == candidate),
            None => {
                let bytes = candidate.as_bytes();
                if bytes.len() > MAX_ID_LEN {
                    return Err(Error::Config(format!(
                        "server id {candidate:?} exceeds {MAX_ID_LEN} bytes"
                    )));
                }
                self.mmap[VOTED_BYTES_AT..VOTED_BYTES_AT + bytes.len()].copy_from_slice(bytes);
                self.put_u32(VOTED_LEN_AT, bytes.len() as u32);
                self.mmap.flush()?;
                Ok(true)
            }
        }
    }

    /// Index and term of the last snapshot-covered command, if any.
    pub fn snapshot_marker(&self) -> Option<(u64, u64)> {
        let index = self.get_u64(SNAPSHOT_INDEX_AT);
        if index == NO_SNAPSHOT {
            None
        } else {
            Some((index, self.get_u64(SNAPSHOT_TERM_AT)))
        }
    }

    pub fn set_snapshot_marker(&mut self, index: u64, term: u64) -> Result<()> {
        self.put_u64(SNAPSHOT_INDEX_AT, index);
        self.put_u64(SNAPSHOT_TERM_AT, term);
        Ok(self.mmap.flush()?)
    }

    fn validate_header(&self) -> Result<()> {
        let magic = self.get_u32(0);
        if magic != MAGIC {
            return Err(Error::corrupt(format!(
                "state file magic {magic:#010x}, expected {MAGIC:#010x}"
            )));
        }
        let version = self.get_u32(4);
        if version != VERSION {
            return Err(Error::corrupt(format!(
                "unsupported state file version {version}"
            )));
        }
        Ok(())
    }

    fn get_u32(&self, at: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.mmap[at..at + 4]);
        u32::from_be_bytes(buf)
    }

    fn put_u32(&mut self, at: usize, value: u32) {
        self.mmap[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn get_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mmap[at..at + 8]);
        u64::from_be_bytes(buf)
    }

    fn put_u64(&mut self, at: usize, value: u64) {
        self.mmap[at..at + 8].copy_from_slice(&value.to_be_bytes());
    }
}
