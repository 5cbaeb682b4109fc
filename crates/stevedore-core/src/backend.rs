//! Collaborator capabilities injected into the operation manager.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BackendError, Entry, EntryUrl, MountError, PromptError, ResolveError, VolumeHandle, VolumeId};

/// Progress callbacks streamed by the backend for one copy-or-move call.
///
/// The stream always ends with `Success` or `Error`. `EntryCopied` fires
/// once per top-level entry materialized at the destination, before the
/// terminal event.
#[derive(Debug, Clone)]
pub enum CopyEvent {
    /// The backend accepted the operation.
    Begin { source: EntryUrl },
    /// Cumulative bytes of `source` processed so far.
    Progress { source: EntryUrl, processed: u64 },
    /// An entry finished materializing at the destination.
    EntryCopied { source: EntryUrl, entry: Entry },
    /// The whole operation succeeded; `entry` is the destination entry.
    Success { entry: Entry },
    /// The operation failed.
    Error { error: BackendError },
}

/// Read side of storage: directory listing and child lookup.
///
/// Consumed by the path resolver for traversal and name probing.
#[async_trait]
pub trait EntryReader: Send + Sync {
    /// Resolve the direct child `name` of `dir`.
    async fn child(&self, dir: &Entry, name: &str) -> Result<Entry, ResolveError>;

    /// List the direct children of `dir`.
    async fn read_children(&self, dir: &Entry) -> Result<Vec<Entry>, ResolveError>;
}

/// The external capability performing actual byte-level work.
///
/// stevedore never touches storage itself; it only sequences calls into this
/// interface and normalizes the resulting callbacks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Start copying (or moving, when `is_move`) `source` into `target_dir`
    /// under `new_name`. Progress streams on the returned channel.
    fn start_copy_or_move(
        &self,
        source: &Entry,
        target_dir: &Entry,
        new_name: &str,
        is_move: bool,
    ) -> mpsc::Receiver<CopyEvent>;

    /// Produce a zip archive of `sources` in `target_dir` named `new_name`.
    /// The returned entry reports the archive's real size.
    async fn zip_selection(
        &self,
        sources: &[Entry],
        target_dir: &Entry,
        new_name: &str,
    ) -> Result<Entry, BackendError>;

    /// Remove a single entry, recursively for directories.
    async fn delete_entry(&self, entry: &Entry) -> Result<(), BackendError>;

    /// Mount an archive as a volume, optionally with a password.
    async fn mount_archive(
        &self,
        archive_url: &EntryUrl,
        password: Option<&str>,
    ) -> Result<VolumeHandle, MountError>;
}

/// Maps entries to the volume that owns them.
pub trait VolumeResolver: Send + Sync {
    /// The volume owning `entry`, or `None` when it cannot be resolved
    /// (volume unmounted or gone).
    fn volume_id(&self, entry: &Entry) -> Option<VolumeId>;
}

/// Asks the user for an archive password.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// Prompt for the password of `filename`. Rejects with
    /// [`PromptError::Cancelled`] when the user dismisses the prompt.
    async fn ask_for_password(&self, filename: &str) -> Result<String, PromptError>;
}

/// Navigation hooks used by the archive mount flow.
///
/// The UI bumps `generation` on every directory change; the mount flow only
/// switches directories if the user has not navigated since the mount was
/// requested.
pub trait ChangeTracker: Send + Sync {
    /// Monotonic counter of user navigations.
    fn generation(&self) -> u64;

    /// Switch the current directory to `entry`.
    fn change_directory(&self, entry: &Entry);
}
