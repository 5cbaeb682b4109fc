//! Error types for file operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EntryUrl, VolumeId};

/// Errors from resolving paths or listing directories.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No entry exists at the given location.
    #[error("entry not found: {url}")]
    NotFound { url: EntryUrl },

    /// The storage backend failed while reading.
    #[error("storage error at {url}: {message}")]
    Storage { url: EntryUrl, message: String },
}

/// Errors reported by the storage backend for write operations.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    /// The source entry disappeared.
    #[error("entry not found: {url}")]
    NotFound { url: EntryUrl },

    /// The destination already holds an entry with that name.
    #[error("entry already exists: {url}")]
    AlreadyExists { url: EntryUrl },

    /// The destination volume cannot be reached.
    #[error("volume unavailable: {volume}")]
    VolumeUnavailable { volume: VolumeId },

    /// Any other backend failure.
    #[error("{message}")]
    Other { message: String },
}

/// Errors from mounting an archive volume.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MountError {
    /// The archive is encrypted and no (or a wrong) password was supplied.
    /// Not terminal: callers retry once with a password from the prompt.
    #[error("archive requires a password")]
    NeedPassword,

    /// The mounter failed internally.
    #[error("internal mount error: {message}")]
    Internal { message: String },

    /// The archive format is not supported.
    #[error("unsupported archive: {message}")]
    Unsupported { message: String },
}

/// Error from the password prompt.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PromptError {
    /// The user dismissed the prompt. Treated as benign abandonment.
    #[error("password prompt cancelled")]
    Cancelled,
}

/// An error that occurred while processing one entry of a task.
///
/// Carried in progress events and task error lists, so it is a plain
/// serializable record rather than a typed error enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// The entry that caused the error.
    pub url: EntryUrl,
    /// A human-readable error message.
    pub message: String,
}

impl OperationError {
    /// Create a new operation error.
    pub fn new(url: EntryUrl, message: impl Into<String>) -> Self {
        Self {
            url,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.url, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_display() {
        let err = OperationError::new(EntryUrl::new("mem://vol/a.txt"), "copy failed");
        assert_eq!(err.to_string(), "mem://vol/a.txt: copy failed");
    }

    #[test]
    fn test_mount_error_variants() {
        assert_eq!(MountError::NeedPassword, MountError::NeedPassword);
        let err = MountError::Internal {
            message: "bad archive".into(),
        };
        assert!(err.to_string().contains("bad archive"));
    }
}
