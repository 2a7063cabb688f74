//! Error types for memory operations.

use thiserror::Error;

/// Errors that can occur in memory operations.
///
/// Faults on individual byte ranges are not errors: address spaces fill them
/// and report them through [`crate::memory::PartialRead`]. These variants are
/// for failures of the machinery itself.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The underlying storage could not produce bytes it claims to hold
    /// (I/O failure, corrupt compressed chunk).
    #[error("Backing store '{store}' failed at {offset:#x}: {message}")]
    BackingStore {
        store: String,
        offset: u64,
        message: String,
    },

    /// The translation structure is unusable as a whole, e.g. the root table
    /// is missing or contains no valid entries.
    #[error("Address translation for '{space}' unusable (root {root:#x}): {message}")]
    AddressTranslation {
        space: String,
        root: u64,
        message: String,
    },

    /// Malformed container manifest, segment header or digest mismatch.
    #[error("Container error: {0}")]
    Container(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl MemoryError {
    /// Create a BackingStore error.
    pub fn backing_store(store: impl Into<String>, offset: u64, msg: impl Into<String>) -> Self {
        MemoryError::BackingStore {
            store: store.into(),
            offset,
            message: msg.into(),
        }
    }

    /// Create an AddressTranslation error.
    pub fn translation(space: impl Into<String>, root: u64, msg: impl Into<String>) -> Self {
        MemoryError::AddressTranslation {
            space: space.into(),
            root,
            message: msg.into(),
        }
    }

    pub fn container(msg: impl Into<String>) -> Self {
        MemoryError::Container(msg.into())
    }
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_store_error() {
        let err = MemoryError::backing_store("image.raw", 0x1000, "short read");
        assert!(err.to_string().contains("image.raw"));
        assert!(err.to_string().contains("0x1000"));
    }

    #[test]
    fn test_translation_error() {
        let err = MemoryError::translation("kernel", 0x1aa000, "root table has no valid entries");
        let msg = err.to_string();
        assert!(msg.contains("kernel"));
        assert!(msg.contains("0x1aa000"));
        assert!(msg.contains("no valid entries"));
    }
}
