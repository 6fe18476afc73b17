//! Error types for the chunk cache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading through the chunk cache
///
/// The enum is `Clone` so that one failed load can be handed to every
/// thread waiting on it; I/O errors are shared behind an `Arc` for that
/// reason.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The physical read detected invalid data
    #[error("Corrupted chunk in {path} at position {position}: {reason}")]
    Corruption {
        path: String,
        position: u64,
        reason: String,
    },

    /// The bounded reference acquisition loop ran out of attempts
    #[error(
        "Could not acquire a reference to chunk {key} after {attempts} attempts. \
         This is likely due to the chunk cache being too small for the number of \
         concurrently running requests, or to a reference counting error such as \
         a double release"
    )]
    CacheExhausted { key: String, attempts: u32 },

    /// Chunk size is not a power of two
    #[error("Chunk size {0} must be a power of two")]
    InvalidChunkSize(usize),

    /// Capacity is fixed at construction
    #[error("Chunk cache capacity cannot be changed at runtime")]
    CapacityImmutable,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Buffer allocation failed
    #[error("Buffer allocation failed for size {size}: {reason}")]
    BufferAllocation { size: usize, reason: String },

    /// Read beyond the end of the file
    #[error("Position {position} is beyond the end of {path} (length {length})")]
    PositionOutOfBounds {
        path: String,
        position: u64,
        length: u64,
    },

    /// Reader used after close
    #[error("Reader for {0} is closed")]
    ReaderClosed(String),

    /// The thread loading a chunk panicked before publishing a result
    #[error("Load of chunk {0} was abandoned before completing")]
    LoadAbandoned(String),
}

impl Error {
    /// Returns true if this error reports corrupted on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }

    /// Build a corruption error
    pub fn corruption(path: impl Into<String>, position: u64, reason: impl Into<String>) -> Self {
        Error::Corruption {
            path: path.into(),
            position,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_is_distinguishable() {
        let corrupt = Error::corruption("/data/nb-1-Data.db", 65536, "bad checksum");
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();

        assert!(corrupt.is_corruption());
        assert!(!io.is_corruption());
    }

    #[test]
    fn test_errors_clone_for_waiters() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        let copy = io.clone();
        assert_eq!(io.to_string(), copy.to_string());
    }

    #[test]
    fn test_exhaustion_message_names_key() {
        let err = Error::CacheExhausted {
            key: "/data/f@4096".to_string(),
            attempts: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/f@4096"));
        assert!(msg.contains("1000 attempts"));
    }
}
