//! Segmented append-only log: an ordered collection of store/index pairs
//! with rollover, truncation, and snapshot streaming.

pub mod index;
pub mod segment;
pub mod store;

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use crate::log::index::ENTRY_WIDTH;
use crate::log::segment::Segment;
use crate::log::store::Store;
use crate::record::Record;

/// Ordered sequence of segments. The last segment is the active one and the
/// only one accepting appends; a full active segment triggers rollover.
///
/// Appends, truncation, and rollover hold the writer lock; reads and offset
/// queries hold the reader lock.
pub struct Log {
    dir: PathBuf,
    state: RwLock<LogState>,
}

struct LogState {
    config: SegmentConfig,
    segments: Vec<Segment>,
}

impl Log {
    /// Opens the log in `dir`, recovering one segment per existing
    /// store/index base offset, or creating a fresh segment at
    /// `config.initial_offset` when the directory holds none.
    pub fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> Result<Self> {
        if config.max_index_bytes < ENTRY_WIDTH {
            return Err(Error::Config(format!(
                "segment.max_index_bytes must be at least {ENTRY_WIDTH}"
            )));
        }

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut base_offsets = BTreeSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_segment_file = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("store") | Some("index")
            );
            if !is_segment_file {
                continue;
            }
            if let Some(base) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                base_offsets.insert(base);
            }
        }

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::open(&dir, base, config.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(&dir, config.initial_offset, config.clone())?);
        }

        Ok(Log {
            dir,
            state: RwLock::new(LogState { config, segments }),
        })
    }

    /// Appends a record to the active segment, rolling over first when the
    /// active segment is maxed. Returns the assigned offset.
    pub fn append(&self, record: Record) -> Result<u64> {
        let mut state = self.state.write();
        if self.active(&state).is_maxed() {
            self.roll(&mut state)?;
        }
        match self.active_mut(&mut state).append(record.clone()) {
            // The index can run out of room before is_maxed trips when the
            // configured cap is not a multiple of the entry width.
            Err(Error::IndexFull) => {
                self.roll(&mut state)?;
                self.active_mut(&mut state).append(record)
            }
            result => result,
        }
    }

    /// Reads the record stored at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let state = self.state.read();
        let segment = Self::locate(&state, offset)
            .ok_or_else(|| Self::out_of_range(&state, offset))?;
        match segment.read(offset) {
            Err(Error::IndexEmpty) => Err(Self::out_of_range(&state, offset)),
            result => result,
        }
    }

    /// Reads up to `max` consecutive records starting at `from`, stopping
    /// early at the log head.
    pub fn read_batch(&self, from: u64, max: usize) -> Result<Vec<Record>> {
        let state = self.state.read();
        if Self::locate(&state, from).is_none() {
            return Err(Self::out_of_range(&state, from));
        }

        let mut records = Vec::new();
        let mut offset = from;
        while records.len() < max {
            let Some(segment) = Self::locate(&state, offset) else {
                break;
            };
            match segment.read(offset) {
                Ok(record) => records.push(record),
                Err(Error::IndexEmpty) => break,
                Err(err) => return Err(err),
            }
            offset += 1;
        }
        Ok(records)
    }

    /// Offset of the oldest retained record.
    pub fn lowest_offset(&self) -> u64 {
        let state = self.state.read();
        state.segments[0].base_offset()
    }

    /// Offset of the newest record, or zero for an empty log.
    pub fn highest_offset(&self) -> u64 {
        let state = self.state.read();
        self.active(&state).next_offset().saturating_sub(1)
    }

    /// Offset the next append will be assigned.
    pub(crate) fn next_offset(&self) -> u64 {
        let state = self.state.read();
        self.active(&state).next_offset()
    }

    /// Removes every segment fully covered by the retention boundary
    /// `lowest`, keeping at least the active segment.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut state = self.state.write();
        let segments = std::mem::take(&mut state.segments);
        let last = segments.len() - 1;
        for (i, segment) in segments.into_iter().enumerate() {
            if i != last && segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                state.segments.push(segment);
            }
        }
        Ok(())
    }

    /// Removes all segments and their files, then reopens the log empty at
    /// the configured initial offset.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.write();
        let initial = state.config.initial_offset;
        self.reset_locked(&mut state, initial)
    }

    /// Resets the log so the next append is assigned `initial_offset`.
    /// Used by snapshot restore, which re-seeds offsets explicitly.
    pub(crate) fn reset_to(&self, initial_offset: u64) -> Result<()> {
        let mut state = self.state.write();
        self.reset_locked(&mut state, initial_offset)
    }

    /// Read-only view over the flushed store contents in segment order,
    /// used for snapshot streaming.
    pub fn reader(&self) -> LogReader {
        let state = self.state.read();
        LogReader {
            stores: state
                .segments
                .iter()
                .map(|segment| segment.store_handle())
                .collect(),
            current: 0,
            position: 0,
        }
    }

    /// Flushes and closes every segment. The log is unusable afterwards.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        for segment in std::mem::take(&mut state.segments) {
            segment.close()?;
        }
        Ok(())
    }

    fn reset_locked(&self, state: &mut LogState, initial_offset: u64) -> Result<()> {
        for segment in std::mem::take(&mut state.segments) {
            segment.remove()?;
        }
        state.config.initial_offset = initial_offset;
        state
            .segments
            .push(Segment::open(&self.dir, initial_offset, state.config.clone())?);
        Ok(())
    }

    fn roll(&self, state: &mut LogState) -> Result<()> {
        let base = self.active(state).next_offset();
        state
            .segments
            .push(Segment::open(&self.dir, base, state.config.clone())?);
        Ok(())
    }

    fn locate<'a>(state: &'a LogState, offset: u64) -> Option<&'a Segment> {
        state
            .segments
            .iter()
            .find(|segment| segment.base_offset() <= offset && offset < segment.next_offset())
    }

    fn out_of_range(state: &LogState, requested: u64) -> Error {
        Error::OffsetOutOfRange {
            requested,
            lowest: state.segments[0].base_offset(),
            highest: state
                .segments
                .last()
                .map(|segment| segment.next_offset().saturating_sub(1))
                .unwrap_or(0),
        }
    }

    fn active<'a>(&self, state: &'a LogState) -> &'a Segment {
        state.segments.last().expect("log always has a segment")
    }

    fn active_mut<'a>(&self, state: &'a mut LogState) -> &'a mut Segment {
        state.segments.last_mut().expect("log always has a segment")
    }
}

/// Concatenated read-only view of the store files in segment order. Sizes
/// are captured at creation, so late appends are not observed.
pub struct LogReader {
    stores: Vec<(Arc<Store>, u64)>,
    current: usize,
    position: u64,
}

impl LogReader {
    /// Total number of bytes the reader will yield.
    pub fn len(&self) -> u64 {
        self.stores.iter().map(|(_, size)| size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some((store, size)) = self.stores.get(self.current) else {
                return Ok(0);
            };
            if self.position >= *size {
                self.current += 1;
                self.position = 0;
                continue;
            }
            let want = buf.len().min((*size - self.position) as usize);
            let n = store
                .read_at(&mut buf[..want], self.position)
                .map_err(|err| match err {
                    Error::Io(io_err) => io_err,
                    other => std::io::Error::other(other),
                })?;
            self.position += n as u64;
            return Ok(n);
        }
    }
}
