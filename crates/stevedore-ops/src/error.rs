//! Errors returned by the operation manager's public API.

use thiserror::Error;

use stevedore_core::{EntryUrl, MountError, ResolveError};

/// Errors surfaced synchronously to callers of the operation manager.
///
/// Operational failures (backend errors while a task runs) never appear
/// here; they travel through the event stream as `Error`-reason events.
#[derive(Debug, Error)]
pub enum OpsError {
    /// The paste or zip target is not a directory.
    #[error("not a directory: {url}")]
    NotADirectory { url: EntryUrl },

    /// Resolving sources or sizes failed before the task was admitted.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Mounting an archive failed terminally.
    #[error("failed to mount {url}: {source}")]
    Mount { url: String, source: MountError },
}
