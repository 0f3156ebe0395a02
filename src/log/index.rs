//! Memory-mapped index translating relative offsets to store positions.

use std::fs::File;

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Width of the relative-offset column.
const OFF_WIDTH: u64 = 4;
/// Width of the store-position column.
const POS_WIDTH: u64 = 8;
/// Total width of one index entry.
pub(crate) const ENTRY_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

/// Fixed-stride table of `(relative offset, store position)` pairs.
///
/// The backing file is grown to its configured maximum and mapped once at
/// open; fullness detection is then a pure size comparison and the map is
/// never resized while live. `close` unmaps before truncating the file back
/// to the live prefix.
pub struct Index {
    file: File,
    mmap: MmapMut,
    size: u64,
}

impl Index {
    /// Opens an index over `file`, growing the file to `max_bytes` and
    /// mapping it read-write shared. The pre-existing file length is taken
    /// as the live size.
    pub fn new(file: File, max_bytes: u64) -> Result<Self> {
        let size = file.metadata()?.len();
        file.set_len(max_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Index { file, mmap, size })
    }

    /// Appends an entry. Fails with `IndexFull` when the mapped region has
    /// no room for another entry.
    pub fn write(&mut self, relative_offset: u32, position: u64) -> Result<()> {
        if self.size + ENTRY_WIDTH > self.mmap.len() as u64 {
            return Err(Error::IndexFull);
        }
        let at = self.size as usize;
        self.mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[at + OFF_WIDTH as usize..at + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Reads entry `at`. `-1` selects the last entry. Fails with
    /// `IndexEmpty` when the index holds no entry at that position.
    pub fn read(&self, at: i64) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(Error::IndexEmpty);
        }
        let entry = if at == -1 {
            self.size / ENTRY_WIDTH - 1
        } else {
            at as u64
        };
        let byte_pos = entry * ENTRY_WIDTH;
        if self.size < byte_pos + ENTRY_WIDTH {
            return Err(Error::IndexEmpty);
        }
        let at = byte_pos as usize;
        let mut off_buf = [0u8; OFF_WIDTH as usize];
        off_buf.copy_from_slice(&self.mmap[at..at + OFF_WIDTH as usize]);
        let mut pos_buf = [0u8; POS_WIDTH as usize];
        pos_buf.copy_from_slice(&self.mmap[at + OFF_WIDTH as usize..at + ENTRY_WIDTH as usize]);
        Ok((u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf)))
    }

    /// Live size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Syncs the map and file, unmaps, and truncates the file back to the
    /// live prefix so reopen sees only real entries.
    pub fn close(self) -> Result<()> {
        let Index { file, mmap, size } = self;
        mmap.flush()?;
        drop(mmap);
        file.set_len(size)?;
        file.sync_all()?;
        Ok(())
    }
}
