//! Chunk cache keys
//!
//! A chunk is identified by the file it comes from, the kind of reader that
//! decodes it and its aligned position. Two readers of the same file but of
//! different kinds (say, compressed vs. uncompressed views) never share
//! entries.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::io::ChunkReader;

/// Cache key for one chunk
///
/// Carries the reader so a miss can load the chunk, but the reader takes no
/// part in equality or hashing.
#[derive(Clone)]
pub struct ChunkKey {
    reader: Arc<dyn ChunkReader>,
    path: Arc<str>,
    kind: &'static str,
    position: u64,
}

impl ChunkKey {
    /// Key of the chunk at aligned `position` in `reader`'s file
    pub fn new(reader: Arc<dyn ChunkReader>, position: u64) -> Self {
        let path: Arc<str> = Arc::from(reader.file_path());
        let kind = reader.kind();
        Self {
            reader,
            path,
            kind,
            position,
        }
    }

    /// Derive the key of another chunk of the same file
    pub fn at(&self, position: u64) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            path: Arc::clone(&self.path),
            kind: self.kind,
            position,
        }
    }

    /// Reader used to load the chunk
    pub fn reader(&self) -> &Arc<dyn ChunkReader> {
        &self.reader
    }

    /// File path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reader implementation kind
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Aligned chunk position
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl PartialEq for ChunkKey {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position && self.kind == other.kind && self.path == other.path
    }
}

impl Eq for ChunkKey {}

impl Hash for ChunkKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.kind.hash(state);
        self.position.hash(state);
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkKey")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("position", &self.position)
            .finish()
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.position)
    }
}

// =============================================================================
// Tests
// =============================================================================
