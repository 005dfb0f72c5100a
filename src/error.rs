//! Error types for framestore
//!
//! Defines a unified error type that can represent errors from all
//! components. Business-level conditions the engine reacts to
//! (`GroupMissing`, `NotReversible`) are their own variants so callers can
//! match on them instead of parsing messages.

use std::fmt;
use std::io;

/// Unified error type for framestore operations
#[derive(Debug)]
pub enum FrameStoreError {
    /// I/O error (file operations)
    Io(io::Error),
    /// Serialization error (bincode or JSON)
    Serialization(String),
    /// Malformed or unreadable log record
    Log(String),
    /// Transaction error (unknown id, invalid state)
    Transaction(String),
    /// Page store error
    Storage(String),
    /// A targeted group read found no such group
    GroupMissing { file_url: String, group: u64 },
    /// `reverse` was asked for an operation that has no inverse
    NotReversible(String),
    /// An update named an operation the processor does not know
    UnknownOperation(String),
}

impl FrameStoreError {
    /// Create a "group does not exist" error for a dataset/group pair
    pub fn group_missing(file_url: &str, group: u64) -> Self {
        FrameStoreError::GroupMissing {
            file_url: file_url.to_string(),
            group,
        }
    }

    /// Create a "not reversible" error for an operation name
    pub fn not_reversible(function_name: &str) -> Self {
        FrameStoreError::NotReversible(function_name.to_string())
    }
}

impl fmt::Display for FrameStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStoreError::Io(e) => write!(f, "{}", e),
            FrameStoreError::Serialization(msg) => write!(f, "{}", msg),
            FrameStoreError::Log(msg) => write!(f, "{}", msg),
            FrameStoreError::Transaction(msg) => write!(f, "{}", msg),
            FrameStoreError::Storage(msg) => write!(f, "{}", msg),
            FrameStoreError::GroupMissing { file_url, group } => {
                write!(f, "Group {} of dataset '{}' does not exist", group, file_url)
            }
            FrameStoreError::NotReversible(name) => {
                write!(f, "Operation '{}' is not reversible", name)
            }
            FrameStoreError::UnknownOperation(name) => {
                write!(f, "Unknown operation '{}'", name)
            }
        }
    }
}

impl std::error::Error for FrameStoreError {}

impl From<io::Error> for FrameStoreError {
    fn from(e: io::Error) -> Self {
        FrameStoreError::Io(e)
    }
}

impl From<serde_json::Error> for FrameStoreError {
    fn from(e: serde_json::Error) -> Self {
        FrameStoreError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for FrameStoreError {
    fn from(e: bincode::Error) -> Self {
        FrameStoreError::Serialization(e.to_string())
    }
}

/// Result type alias for framestore operations
pub type Result<T> = std::result::Result<T, FrameStoreError>;
