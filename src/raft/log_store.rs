//! Command-log storage for consensus, reusing the segmented log so the
//! replica's own entries live on the same machinery as the records.

use std::path::Path;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use crate::log::Log;
use crate::raft::rpc::CommandEntry;
use crate::record::Record;

/// Segmented storage for consensus entries. Entry index `i` is stored as
/// the record at offset `i`; the assigned offset is checked against the
/// entry index on every write so divergence fails loudly instead of
/// silently renumbering the log.
pub struct LogStore {
    log: Log,
}

impl LogStore {
    pub fn open(dir: impl AsRef<Path>, mut config: SegmentConfig) -> Result<Self> {
        config.initial_offset = 0;
        Ok(LogStore {
            log: Log::open(dir, config)?,
        })
    }

    /// Index of the oldest retained entry, `None` when the log is empty.
    pub fn first_index(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.log.lowest_offset())
        }
    }

    /// Index of the newest entry, `None` when the log is empty.
    pub fn last_index(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.log.next_offset() - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log.next_offset() == self.log.lowest_offset()
    }

    pub fn get_log(&self, index: u64) -> Result<CommandEntry> {
        Ok(entry_from(self.log.read(index)?))
    }

    /// Term of the entry at `index`.
    pub fn term_of(&self, index: u64) -> Result<u64> {
        Ok(self.log.read(index)?.term)
    }

    /// Up to `max` consecutive entries starting at `from`.
    pub fn entries_from(&self, from: u64, max: usize) -> Result<Vec<CommandEntry>> {
        Ok(self
            .log
            .read_batch(from, max)?
            .into_iter()
            .map(entry_from)
            .collect())
    }

    /// Leader path: appends a fresh command under `term`, returning the
    /// index the log assigned.
    pub fn append_command(&self, term: u64, command: Vec<u8>) -> Result<u64> {
        let mut record = Record::new(command);
        record.term = term;
        self.log.append(record)
    }

    /// Follower path: stores a replicated entry at exactly its index.
    pub fn store_log(&self, entry: &CommandEntry) -> Result<()> {
        let mut record = Record::new(entry.command.clone());
        record.term = entry.term;
        let assigned = self.log.append(record)?;
        if assigned != entry.index {
            return Err(Error::corrupt(format!(
                "command log assigned index {assigned}, expected {}",
                entry.index
            )));
        }
        Ok(())
    }

    pub fn store_logs(&self, entries: &[CommandEntry]) -> Result<()> {
        for entry in entries {
            self.store_log(entry)?;
        }
        Ok(())
    }

    /// Head compaction: drops entries at and below `max`.
    pub fn delete_range(&self, _min: u64, max: u64) -> Result<()> {
        self.log.truncate(max)
    }

    /// Removes the conflicting suffix starting at `from` by re-reading the
    /// surviving prefix and rebuilding the log from it.
    pub fn truncate_back(&self, from: u64) -> Result<()> {
        let Some(last) = self.last_index() else {
            return Ok(());
        };
        if from > last {
            return Ok(());
        }
        let first = self.log.lowest_offset();
        if from <= first {
            return self.reset_to(from);
        }

        let survivors = self.log.read_batch(first, (from - first) as usize)?;
        self.log.reset_to(first)?;
        for record in survivors {
            let expected = record.offset;
            let mut rebuilt = Record::new(record.value);
            rebuilt.term = record.term;
            let assigned = self.log.append(rebuilt)?;
            if assigned != expected {
                return Err(Error::corrupt(format!(
                    "rebuild assigned index {assigned}, expected {expected}"
                )));
            }
        }
        Ok(())
    }

    /// Empties the log so the next stored entry gets `next_index`. Used
    /// after snapshot installation.
    pub fn reset_to(&self, next_index: u64) -> Result<()> {
        self.log.reset_to(next_index)
    }

    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}

fn entry_from(record: Record) -> CommandEntry {
    CommandEntry {
        index: record.offset,
        term: record.term,
        command: record.value,
    }
}
