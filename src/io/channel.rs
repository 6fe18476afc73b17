//! Positional-read channels over data files
//!
//! A channel is the raw byte source underneath a chunk reader. It is shared
//! (behind an `Arc`) by every reader of the same file and never buffers.

use std::fmt;
use std::fs::File;
use std::path::Path;

use bytes::Bytes;

use crate::error::Result;

/// Thread-safe positional reads from a single file
pub trait Channel: Send + Sync + fmt::Debug {
    /// Path of the underlying file
    fn path(&self) -> &str;

    /// Current size of the file in bytes
    fn size(&self) -> Result<u64>;

    /// Read into `buf` starting at `position`, returning the number of bytes read.
    ///
    /// Returns 0 at end of file.
    fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize>;
}

/// Channel backed by an open file
#[derive(Debug)]
pub struct FileChannel {
    path: String,
    file: File,
}

impl FileChannel {
    /// Open `path` for reading
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self {
            path: path.to_string_lossy().into_owned(),
            file,
        })
    }
}

impl Channel for FileChannel {
    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, position)?)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(self.file.seek_read(buf, position)?)
    }
}

/// Channel over an immutable in-memory file image
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    path: String,
    data: Bytes,
}

impl MemoryChannel {
    /// Create a channel serving `data` under the given path
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

impl Channel for MemoryChannel {
    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let len = self.data.len() as u64;
        if position >= len {
            return Ok(0);
        }
        let start = position as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

// =============================================================================
// Tests
// =============================================================================
