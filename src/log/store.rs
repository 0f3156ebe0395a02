//! Append-only store file holding length-prefixed record payloads.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;

use byteorder::{BigEndian, WriteBytesExt};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Width of the big-endian length prefix preceding every payload.
pub(crate) const LEN_WIDTH: u64 = 8;

/// Buffered append-only byte file. Writes go through an internal buffer;
/// every public read flushes first so callers always observe their own
/// appends.
pub struct Store {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: BufWriter<File>,
    size: u64,
}

impl Store {
    /// Wraps an opened file, picking up its current size.
    pub fn new(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Store {
            inner: Mutex::new(Inner {
                buf: BufWriter::new(file),
                size,
            }),
        })
    }

    /// Appends a payload preceded by its 8-byte big-endian length.
    ///
    /// Returns the total bytes written and the file position at which the
    /// frame starts.
    pub fn append(&self, payload: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.buf.write_u64::<BigEndian>(payload.len() as u64)?;
        inner.buf.write_all(payload)?;
        let written = payload.len() as u64 + LEN_WIDTH;
        inner.size += written;
        Ok((written, pos))
    }

    /// Reads the payload of the frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;

        let file = inner.buf.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)
            .map_err(short_read)?;
        let len = u64::from_be_bytes(len_buf);

        let mut payload = vec![0u8; len as usize];
        file.read_exact_at(&mut payload, pos + LEN_WIDTH)
            .map_err(short_read)?;
        Ok(payload)
    }

    /// Reads up to `buf.len()` raw bytes starting at `offset`. Used by the
    /// snapshot reader; does not interpret framing.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        Ok(inner.buf.get_ref().read_at(buf, offset)?)
    }

    /// Current logical size in bytes, including any buffered tail.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Flushes buffered writes and syncs the file to stable storage.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.buf.get_ref().sync_all()?;
        Ok(())
    }
}

fn short_read(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::corrupt("short read: store file truncated mid-frame")
    } else {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .append(true)
            .open(dir.path().join("test.store"))
            .unwrap();
        Store::new(file).unwrap()
    }

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let payload = b"hello world";
        let mut positions = Vec::new();
        for i in 0..3u64 {
            let (written, pos) = store.append(payload).unwrap();
            assert_eq!(written, payload.len() as u64 + LEN_WIDTH);
            assert_eq!(pos, i * written);
            positions.push(pos);
        }

        for pos in positions {
            assert_eq!(store.read(pos).unwrap(), payload);
        }
        assert_eq!(store.size(), 3 * (payload.len() as u64 + LEN_WIDTH));
    }

    #[test]
    fn test_read_at_sees_buffered_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.append(b"abc").unwrap();

        // Raw read of the length prefix forces a flush first.
        let mut buf = [0u8; LEN_WIDTH as usize];
        let n = store.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(buf), 3);
    }

    #[test]
    fn test_reopen_with_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.store");

        let (_, pos) = {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .append(true)
                .open(&path)
                .unwrap();
            let store = Store::new(file).unwrap();
            let out = store.append(b"persisted").unwrap();
            store.close().unwrap();
            out
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .open(&path)
            .unwrap();
        let store = Store::new(file).unwrap();
        assert_eq!(store.size(), 9 + LEN_WIDTH);
        assert_eq!(store.read(pos).unwrap(), b"persisted");
    }

    #[test]
    fn test_short_read_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        match store.read(0) {
            Err(Error::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
