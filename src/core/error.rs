//! Error types and the consensus-library error mapping.
//!
//! The raft integration core distinguishes recoverable conditions (a log
//! range that has been compacted away, a snapshot that is still being
//! generated, a command that lost its term) from fatal ones (a corrupted
//! local state, a failed durable write). Fatal errors abort the process:
//! continuing after either would risk silent divergence between replicas.

use thiserror::Error;

/// Common error conditions of the raft integration core.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested log range is missing from the meta engine, below the
    /// truncated index, or beyond the last index.
    #[error("log entries unavailable")]
    Unavailable,

    /// A snapshot is being generated; the consensus library retries.
    #[error("storage temporarily unavailable")]
    TemporarilyUnavailable,

    /// The command's term is behind, its proposal was superseded, or the
    /// peer lost leadership while the command was pending.
    #[error("stale command at term {term}")]
    StaleCommand { term: u64 },

    /// The command's epoch is behind the cell's current epoch.
    #[error("stale epoch: current {current_version}, request {request_version}")]
    StaleEpoch {
        current_version: u64,
        request_version: u64,
    },

    /// A proposal arrived for a cell this store does not host.
    #[error("cell {cell_id} not found")]
    CellNotFound { cell_id: u64 },

    /// A storage engine operation failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// Local state violates an invariant. Always fatal.
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl Error {
    /// Create an Engine error from any displayable cause.
    pub fn engine(cause: impl std::fmt::Display) -> Self {
        Self::Engine(cause.to_string())
    }

    /// Create a Corrupt error from any displayable cause.
    pub fn corrupt(cause: impl std::fmt::Display) -> Self {
        Self::Corrupt(cause.to_string())
    }

    /// Check if this error must abort the process.
    ///
    /// Engine failures on the persistence path and invariant violations
    /// are fatal; everything else is surfaced to the caller or to the
    /// consensus library.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::Corrupt(_))
    }

    /// Check if this error marks the command as stale for the client.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleCommand { .. } | Self::StaleEpoch { .. })
    }
}

/// Result type using the core error.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Consensus-library error mapping
// ============================================================================

/// Map a core error into the error space of the consensus library.
///
/// `Unavailable` makes the library request a snapshot for the lagging
/// follower; `TemporarilyUnavailable` makes it retry the snapshot fetch.
/// Anything else is opaque to the library.
impl From<Error> for raft::Error {
    fn from(e: Error) -> raft::Error {
        match e {
            Error::Unavailable => raft::Error::Store(raft::StorageError::Unavailable),
            Error::TemporarilyUnavailable => {
                raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable)
            }
            other => raft::Error::Store(raft::StorageError::Other(Box::new(other))),
        }
    }
}
