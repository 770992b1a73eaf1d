//! Error types shared by the update buffer, the grouping logic and the disk tree.

use std::io;
use thiserror::Error;

/// Errors that can occur in RR-Tree operations
#[derive(Debug, Error)]
pub enum RRTreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A caller broke an API contract (for example grouping operations
    /// against a node that has no child entries to route into).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Tree is closed")]
    Closed,
}

/// Result type for RR-Tree operations
pub type RRTreeResult<T> = Result<T, RRTreeError>;

impl RRTreeError {
    /// Shorthand for a page-level data corruption error.
    pub(crate) fn corrupted(message: impl Into<String>) -> Self {
        RRTreeError::Io(io::Error::new(io::ErrorKind::InvalidData, message.into()))
    }
}
