//! A segment binds one store file and one index file under a base offset.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prost::Message;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use crate::log::index::Index;
use crate::log::store::Store;
use crate::record::Record;

/// One store/index pair. Index entry `k` refers to the record at offset
/// `base_offset + k`.
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    store_path: PathBuf,
    index_path: PathBuf,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    /// Opens (or creates) the `{base_offset}.store` and `{base_offset}.index`
    /// pair in `dir` and derives `next_offset` from the last index entry.
    pub fn open(dir: &Path, base_offset: u64, config: SegmentConfig) -> Result<Self> {
        let store_path = dir.join(format!("{base_offset}.store"));
        let store_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .append(true)
            .open(&store_path)?;
        let store = Arc::new(Store::new(store_file)?);

        let index_path = dir.join(format!("{base_offset}.index"));
        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index_path)?;
        let index = Index::new(index_file, config.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((relative, _)) => base_offset + u64::from(relative) + 1,
            Err(Error::IndexEmpty) => base_offset,
            Err(err) => return Err(err),
        };

        Ok(Segment {
            store,
            index,
            store_path,
            index_path,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Appends a record, assigning it the segment's next offset.
    pub fn append(&mut self, mut record: Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;
        let bytes = record.encode_to_vec();
        let (_, position) = self.store.append(&bytes)?;
        self.index
            .write((offset - self.base_offset) as u32, position)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Reads the record at an absolute offset.
    pub fn read(&self, offset: u64) -> Result<Record> {
        let relative = (offset - self.base_offset) as i64;
        let (_, position) = self.index.read(relative)?;
        let bytes = self.store.read(position)?;
        Ok(Record::decode(bytes.as_slice())?)
    }

    /// Whether the store or the index has reached its configured cap.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Shared handle to the store plus its current flushed-visible size,
    /// captured for snapshot readers.
    pub(crate) fn store_handle(&self) -> (Arc<Store>, u64) {
        (Arc::clone(&self.store), self.store.size())
    }

    /// Closes the segment and deletes both backing files.
    pub fn remove(self) -> Result<()> {
        let store_path = self.store_path.clone();
        let index_path = self.index_path.clone();
        self.close()?;
        std::fs::remove_file(index_path)?;
        std::fs::remove_file(store_path)?;
        Ok(())
    }

    /// Flushes and closes the store, then the index.
    pub fn close(self) -> Result<()> {
        self.store.close()?;
        self.index.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::index::ENTRY_WIDTH;
    use tempfile::TempDir;

    fn record() -> Record {
        Record::new(b"hello world".to_vec())
    }

    #[test]
    fn test_append_until_index_full() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENTRY_WIDTH * 3,
            initial_offset: 0,
        };

        let mut segment = Segment::open(dir.path(), 16, config.clone()).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let offset = segment.append(record()).unwrap();
            assert_eq!(offset, 16 + i);

            let got = segment.read(offset).unwrap();
            assert_eq!(got.value, record().value);
            assert_eq!(got.offset, offset);
        }

        assert!(segment.is_maxed());
        match segment.append(record()) {
            Err(Error::IndexFull) => {}
            other => panic!("expected IndexFull, got {other:?}"),
        }
    }

    #[test]
    fn test_reopen_restores_next_offset() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENTRY_WIDTH * 3,
            initial_offset: 0,
        };

        {
            let mut segment = Segment::open(dir.path(), 16, config.clone()).unwrap();
            for _ in 0..3 {
                segment.append(record()).unwrap();
            }
            segment.close().unwrap();
        }

        // Reopen with a store cap the existing contents already exceed.
        let reopened_config = SegmentConfig {
            max_store_bytes: 10,
            max_index_bytes: 1024,
            initial_offset: 0,
        };
        let segment = Segment::open(dir.path(), 16, reopened_config).unwrap();
        assert_eq!(segment.base_offset(), 16);
        assert_eq!(segment.next_offset(), 19);
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_remove_deletes_files() {
        let dir = TempDir::new().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        };

        let mut segment = Segment::open(dir.path(), 0, config.clone()).unwrap();
        segment.append(record()).unwrap();
        segment.remove().unwrap();

        assert!(!dir.path().join("0.store").exists());
        assert!(!dir.path().join("0.index").exists());

        let segment = Segment::open(dir.path(), 0, config).unwrap();
        assert_eq!(segment.next_offset(), 0);
        assert!(!segment.is_maxed());
    }
}
