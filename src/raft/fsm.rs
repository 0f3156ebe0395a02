//! The state machine advanced by committed commands, plus snapshot
//! plumbing.
//!
//! The FSM is the only writer of the record log, which is what keeps the
//! offset a record receives equal to the consensus index of the command
//! that carried it. Snapshot restore is the single exception; it re-seeds
//! the log's initial offset explicitly from the restored stream.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::error;
use prost::Message;

use crate::error::{Error, Result};
use crate::log::{Log, LogReader};
use crate::raft::rpc::CommandEntry;
use crate::record::{decode_append_command, Record};

pub struct Fsm {
    log: Arc<Log>,
}

impl Fsm {
    pub fn new(log: Arc<Log>) -> Self {
        Fsm { log }
    }

    /// Applies a committed command, returning the offset it produced.
    ///
    /// The assigned offset must equal the entry's consensus index; any
    /// divergence means the record log was written outside the FSM and the
    /// apply fails rather than renumbering history.
    pub fn apply(&self, entry: &CommandEntry) -> Result<u64> {
        let mut record = decode_append_command(&entry.command)?;
        record.term = entry.term;
        let offset = self.log.append(record)?;
        if offset != entry.index {
            error!(
                "record log assigned offset {offset} for command at index {}",
                entry.index
            );
            return Err(Error::corrupt(format!(
                "assigned offset {offset} diverged from command index {}",
                entry.index
            )));
        }
        Ok(offset)
    }

    /// Index of the last command reflected in the record log, `None` when
    /// nothing has been applied yet. Offsets equal command indices, so
    /// this is one below the log's next offset.
    pub(crate) fn applied_up_to(&self) -> Option<u64> {
        self.log.next_offset().checked_sub(1)
    }

    /// Captures the current record log contents for streaming.
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            reader: self.log.reader(),
        }
    }

    /// Replaces the record log with the contents of a snapshot stream:
    /// a big-endian length followed by that many bytes of store frames.
    /// The restored log starts at the first record's offset.
    pub fn restore<R: Read>(&self, reader: &mut R) -> Result<()> {
        let total = reader.read_u64::<BigEndian>()?;
        let mut remaining = total;
        let mut restored_any = false;

        while remaining > 0 {
            if remaining < 8 {
                return Err(Error::corrupt("snapshot stream ends mid-frame"));
            }
            let frame_len = reader.read_u64::<BigEndian>()?;
            if remaining - 8 < frame_len {
                return Err(Error::corrupt("snapshot frame exceeds stream length"));
            }
            let mut payload = vec![0u8; frame_len as usize];
            reader.read_exact(&mut payload)?;
            remaining -= 8 + frame_len;

            let record = Record::decode(payload.as_slice())?;
            if !restored_any {
                self.log.reset_to(record.offset)?;
                restored_any = true;
            }
            let expected = record.offset;
            let assigned = self.log.append(record)?;
            if assigned != expected {
                return Err(Error::corrupt(format!(
                    "restore assigned offset {assigned}, expected {expected}"
                )));
            }
        }

        if !restored_any {
            self.log.reset()?;
        }
        Ok(())
    }
}

/// A point-in-time view of the record log, persisted as a length-prefixed
/// byte stream.
pub struct FsmSnapshot {
    reader: LogReader,
}

impl FsmSnapshot {
    /// Bytes `persist` will write, including the length prefix.
    pub fn len(&self) -> u64 {
        self.reader.len() + 8
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Writes the length prefix and the record stream into `sink`.
    pub fn persist<W: Write>(mut self, sink: &mut W) -> Result<()> {
        sink.write_u64::<BigEndian>(self.reader.len())?;
        std::io::copy(&mut self.reader, sink)?;
        Ok(())
    }
}

/// Directory of durable snapshots. A single current snapshot is kept;
/// writes go through a temp file and an atomic rename.
pub struct SnapshotStore {
    dir: PathBuf,
}

/// An opened snapshot: its marker pair plus a reader positioned at the
/// FSM stream.
pub struct SnapshotFile {
    pub last_included_index: u64,
    pub last_included_term: u64,
    file: File,
}

impl Read for SnapshotFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

const SNAPSHOT_NAME: &str = "current.snapshot";

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir })
    }

    /// Persists `snapshot` as the current snapshot, stamped with the index
    /// and term of the last command it covers.
    pub fn save(&self, index: u64, term: u64, snapshot: FsmSnapshot) -> Result<PathBuf> {
        let temp_path = self.dir.join(format!("{SNAPSHOT_NAME}.tmp"));
        let final_path = self.dir.join(SNAPSHOT_NAME);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_u64::<BigEndian>(index)?;
        file.write_u64::<BigEndian>(term)?;
        snapshot.persist(&mut file)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &final_path)?;
        Ok(final_path)
    }

    /// Opens the current snapshot, if one exists.
    pub fn latest(&self) -> Result<Option<SnapshotFile>> {
        let path = self.dir.join(SNAPSHOT_NAME);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let last_included_index = file.read_u64::<BigEndian>()?;
        let last_included_term = file.read_u64::<BigEndian>()?;
        Ok(Some(SnapshotFile {
            last_included_index,
            last_included_term,
            file,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::record::encode_append_command;
    use tempfile::TempDir;

    fn open_log(dir: &Path) -> Arc<Log> {
        Arc::new(
            Log::open(
                dir,
                SegmentConfig {
                    max_store_bytes: 1024,
                    max_index_bytes: 1024,
                    initial_offset: 0,
                },
            )
            .unwrap(),
        )
    }

    fn append_entry(index: u64, term: u64, value: &[u8]) -> CommandEntry {
        CommandEntry {
            index,
            term,
            command: encode_append_command(&Record::new(value.to_vec())),
        }
    }

    #[test]
    fn test_apply_returns_command_index() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path());
        let fsm = Fsm::new(Arc::clone(&log));

        for i in 0..3u64 {
            let offset = fsm.apply(&append_entry(i, 1, b"hello")).unwrap();
            assert_eq!(offset, i);
        }

        let record = log.read(2).unwrap();
        assert_eq!(record.value, b"hello");
        assert_eq!(record.term, 1);
    }

    #[test]
    fn test_apply_rejects_diverged_index() {
        let dir = TempDir::new().unwrap();
        let fsm = Fsm::new(open_log(dir.path()));

        match fsm.apply(&append_entry(5, 1, b"gap")) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path());
        let fsm = Fsm::new(Arc::clone(&log));

        for i in 0..4u64 {
            fsm.apply(&append_entry(i, 2, format!("record {i}").as_bytes()))
                .unwrap();
        }

        let mut buf = Vec::new();
        fsm.snapshot().persist(&mut buf).unwrap();

        // Restoring into a different node's log reproduces the records at
        // their original offsets.
        let other_dir = TempDir::new().unwrap();
        let other_log = open_log(other_dir.path());
        let other_fsm = Fsm::new(Arc::clone(&other_log));
        other_fsm.restore(&mut buf.as_slice()).unwrap();

        assert_eq!(other_log.lowest_offset(), 0);
        assert_eq!(other_log.highest_offset(), 3);
        for i in 0..4u64 {
            assert_eq!(
                other_log.read(i).unwrap().value,
                format!("record {i}").into_bytes()
            );
        }
    }

    #[test]
    fn test_restore_empty_snapshot_resets() {
        let dir = TempDir::new().unwrap();
        let log = open_log(dir.path());
        let fsm = Fsm::new(Arc::clone(&log));
        fsm.apply(&append_entry(0, 1, b"stale")).unwrap();

        let mut stream: Vec<u8> = Vec::new();
        stream.write_u64::<BigEndian>(0).unwrap();
        fsm.restore(&mut stream.as_slice()).unwrap();

        assert!(matches!(
            log.read(0),
            Err(Error::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_snapshot_store_save_and_latest() {
        let data_dir = TempDir::new().unwrap();
        let snap_dir = TempDir::new().unwrap();
        let log = open_log(data_dir.path());
        let fsm = Fsm::new(Arc::clone(&log));
        fsm.apply(&append_entry(0, 3, b"persist me")).unwrap();

        let store = SnapshotStore::open(snap_dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());

        store.save(0, 3, fsm.snapshot()).unwrap();
        let mut latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.last_included_index, 0);
        assert_eq!(latest.last_included_term, 3);

        // The stored stream restores cleanly.
        let restore_dir = TempDir::new().unwrap();
        let restored_log = open_log(restore_dir.path());
        Fsm::new(Arc::clone(&restored_log))
            .restore(&mut latest)
            .unwrap();
        assert_eq!(restored_log.read(0).unwrap().value, b"persist me");
    }
}
