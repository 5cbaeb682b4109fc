//! The operation manager: request intake, task driving and event emission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use stevedore_core::{
    ChangeTracker, CopyEvent, Entry, EntryReader, EntryUrl, MountError, OperationError,
    OpsConfig, PasswordPrompt, PromptError, StorageBackend, Task, TaskId, TaskKind, TaskState,
    TaskStatus, VolumeHandle, VolumeId, VolumeResolver,
};
use stevedore_resolve::PathResolver;

use crate::error::OpsError;
use crate::events::{EntryChangeKind, EventRouter, FileOperationEvent, ProgressReason};
use crate::queue::{Admission, TaskQueue};
use crate::speed::Speedometer;

/// Progress summed across every live task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatus {
    /// Number of pending or running tasks.
    pub num_tasks: usize,
    /// Source entries not yet fully processed, across all tasks.
    pub num_remaining_items: usize,
    /// Bytes processed so far, across all tasks.
    pub processed_bytes: u64,
    /// Bytes to process in total, across all tasks.
    pub total_bytes: u64,
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    volumes: Arc<dyn VolumeResolver>,
    resolver: PathResolver,
    queue: TaskQueue,
    router: EventRouter,
    config: OpsConfig,
    next_task_id: AtomicU64,
    /// Status of every live (pending or running) task, for aggregation.
    board: Mutex<IndexMap<TaskId, TaskStatus>>,
}

/// Coordinates copy, move, zip, delete and archive-mount tasks across
/// storage volumes.
///
/// Construct one per backend with [`OperationManager::new`]; clones share
/// the same queue and event stream. Operations return once their task is
/// admitted or waitlisted — progress, success and failure are observable
/// only through [`subscribe`](Self::subscribe).
#[derive(Clone)]
pub struct OperationManager {
    inner: Arc<Inner>,
}

impl OperationManager {
    /// Create a manager over the given backend.
    ///
    /// `reader` is the read side used for traversal and name deduplication;
    /// fixtures typically pass the same object as `backend`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        reader: Arc<dyn EntryReader>,
        volumes: Arc<dyn VolumeResolver>,
        config: OpsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                volumes: volumes.clone(),
                resolver: PathResolver::new(reader),
                queue: TaskQueue::new(volumes),
                router: EventRouter::new(config.event_capacity),
                config,
                next_task_id: AtomicU64::new(0),
                board: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// Subscribe to the operation event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FileOperationEvent> {
        self.inner.router.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn event_stream(&self) -> BroadcastStream<FileOperationEvent> {
        self.inner.router.stream()
    }

    /// Start copying (or moving, when `is_move`) `source_entries` into
    /// `target_dir`.
    ///
    /// Sources are sized recursively before admission; destination names are
    /// deduplicated per entry as the task runs. Returns the created task id,
    /// or `None` when there is nothing to do (empty selection, or a move
    /// whose sources already live in the target directory).
    pub async fn paste(
        &self,
        source_entries: Vec<Entry>,
        target_dir: Entry,
        is_move: bool,
    ) -> Result<Option<TaskId>, OpsError> {
        if source_entries.is_empty() {
            return Ok(None);
        }
        if !target_dir.is_directory {
            return Err(OpsError::NotADirectory {
                url: target_dir.url.clone(),
            });
        }

        let sources: Vec<Entry> = if is_move {
            source_entries
                .into_iter()
                .filter(|entry| !is_directly_inside(&target_dir.url, &entry.url))
                .collect()
        } else {
            source_entries
        };
        if sources.is_empty() {
            return Ok(None);
        }

        let kind = if is_move { TaskKind::Move } else { TaskKind::Copy };
        let mut task = Task::new(self.next_task_id(), kind, sources, Some(target_dir.clone()));

        if self.inner.volumes.volume_id(&target_dir).is_none() {
            return Ok(Some(self.fail_unresolvable_destination(task)));
        }

        let mut total = 0u64;
        for entry in &task.source_entries {
            let bytes = self
                .inner
                .resolver
                .total_bytes(std::slice::from_ref(entry))
                .await?;
            task.entry_totals.push(bytes);
            total += bytes;
        }
        task.total_bytes = total;

        let id = task.id;
        self.track(&task);
        self.dispatch(self.inner.queue.submit(task));
        Ok(Some(id))
    }

    /// Start deleting `entries`.
    ///
    /// Totals cover only the supplied entries; whatever the backend removes
    /// beneath directories is its own business. Emits `delete`-typed events.
    pub fn delete_entries(&self, entries: Vec<Entry>) -> Option<TaskId> {
        if entries.is_empty() {
            return None;
        }
        let mut task = Task::new(self.next_task_id(), TaskKind::Delete, entries, None);
        task.entry_totals = task.source_entries.iter().map(|e| e.size).collect();
        task.total_bytes = task.entry_totals.iter().sum();

        let id = task.id;
        self.track(&task);
        self.dispatch(self.inner.queue.submit(task));
        Some(id)
    }

    /// Start zipping `source_entries` into an archive in `target_dir`.
    ///
    /// The archive is named after a single source's stem, or "Archive" for
    /// multi-entry selections, deduplicated against the target's children.
    /// The begin event reports a conservative 1-byte total; the real size is
    /// known only once the backend hands back the archive entry.
    pub async fn zip_selection(
        &self,
        source_entries: Vec<Entry>,
        target_dir: Entry,
    ) -> Result<Option<TaskId>, OpsError> {
        if source_entries.is_empty() {
            return Ok(None);
        }
        if !target_dir.is_directory {
            return Err(OpsError::NotADirectory {
                url: target_dir.url.clone(),
            });
        }

        let task = Task::new(
            self.next_task_id(),
            TaskKind::Zip,
            source_entries,
            Some(target_dir.clone()),
        );

        if self.inner.volumes.volume_id(&target_dir).is_none() {
            return Ok(Some(self.fail_unresolvable_destination(task)));
        }

        let id = task.id;
        self.track(&task);
        self.dispatch(self.inner.queue.submit(task));
        Ok(Some(id))
    }

    /// Mount the archive at `archive_url` and switch the current directory
    /// to its root, unless the user has navigated elsewhere in the meantime.
    ///
    /// A `NeedPassword` rejection triggers exactly one retry with a password
    /// from `prompt`; cancelling the prompt abandons the mount without
    /// error. Any other rejection is returned, keyed by the archive URL.
    pub async fn mount_archive_and_change_directory(
        &self,
        tracker: &dyn ChangeTracker,
        prompt: &dyn PasswordPrompt,
        archive_url: EntryUrl,
    ) -> Result<(), OpsError> {
        let task = Task::new(self.next_task_id(), TaskKind::Mount, Vec::new(), None);
        let Admission::RunNow(mut task) = self.inner.queue.submit(task) else {
            unreachable!("mount tasks have no volume affinity");
        };

        let generation = tracker.generation();
        let (outcome, result) = match self.mount_with_retry(prompt, &archive_url).await {
            Ok(Some(handle)) => {
                if tracker.generation() == generation {
                    tracker.change_directory(&handle.root);
                } else {
                    info!(archive = %archive_url, "user navigated during mount; directory left unchanged");
                }
                (TaskState::Succeeded, Ok(()))
            }
            // A cancelled password prompt abandons the mount silently.
            Ok(None) => (TaskState::Succeeded, Ok(())),
            Err(source) => {
                warn!(archive = %archive_url, error = %source, "archive mount failed");
                (
                    TaskState::Failed,
                    Err(OpsError::Mount {
                        url: archive_url.to_string(),
                        source,
                    }),
                )
            }
        };

        let promoted = self.inner.queue.complete(&mut task, outcome);
        for next in promoted {
            self.spawn_task(next);
        }
        result
    }

    /// Status of one live task, if it is still pending or running.
    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.board().get(&task_id).cloned()
    }

    /// Progress summed across every live task.
    pub fn aggregate_status(&self) -> AggregateStatus {
        let board = self.board();
        let mut aggregate = AggregateStatus {
            num_tasks: board.len(),
            num_remaining_items: 0,
            processed_bytes: 0,
            total_bytes: 0,
        };
        for status in board.values() {
            aggregate.num_remaining_items += status.num_remaining_items;
            aggregate.processed_bytes += status.processed_bytes;
            aggregate.total_bytes += status.total_bytes;
        }
        aggregate
    }

    /// Whether any task is pending or running.
    pub fn has_active_tasks(&self) -> bool {
        self.inner.queue.has_queued_tasks()
    }

    /// Pending tasks waiting on `volume`, in FIFO order.
    pub fn pending_tasks_for_volume(&self, volume: &VolumeId) -> Vec<Task> {
        self.inner.queue.pending_tasks_for_volume(volume)
    }

    /// Every pending task, in submission order.
    pub fn all_pending_tasks(&self) -> Vec<Task> {
        self.inner.queue.all_pending_tasks()
    }

    fn next_task_id(&self) -> TaskId {
        TaskId(self.inner.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    fn board(&self) -> std::sync::MutexGuard<'_, IndexMap<TaskId, TaskStatus>> {
        self.inner.board.lock().expect("status board poisoned")
    }

    fn track(&self, task: &Task) {
        self.board().insert(task.id, task.status());
    }

    fn untrack(&self, task_id: TaskId) {
        self.board().shift_remove(&task_id);
    }

    fn refresh_board(&self, task_id: TaskId, status: &TaskStatus) {
        if let Some(slot) = self.board().get_mut(&task_id) {
            *slot = status.clone();
        }
    }

    fn dispatch(&self, admission: Admission) {
        if let Admission::RunNow(task) = admission {
            self.spawn_task(task);
        }
    }

    fn spawn_task(&self, task: Task) {
        let manager = self.clone();
        tokio::spawn(async move {
            match task.kind {
                TaskKind::Copy | TaskKind::Move => manager.run_transfer(task).await,
                TaskKind::Delete => manager.run_delete(task).await,
                TaskKind::Zip => manager.run_zip(task).await,
                TaskKind::Mount => unreachable!("mount tasks are driven inline"),
            }
        });
    }

    /// Drive a copy or move task: per source entry in order, deduplicate the
    /// destination name, relay the backend's progress stream, and emit
    /// entry-change events as entries materialize.
    async fn run_transfer(&self, mut task: Task) {
        let target_dir = task.target_dir.clone().expect("transfer task without target");
        let is_move = task.kind == TaskKind::Move;

        let mut speed = Speedometer::new(self.inner.config.speed_window);
        speed.set_total_bytes(task.total_bytes);
        speed.update(0);
        self.emit_progress(&task, ProgressReason::Begin, None, &speed);

        let sources = task.source_entries.clone();
        let mut processed_base = 0u64;
        let mut consecutive_errors = 0usize;

        for (index, source) in sources.iter().enumerate() {
            let entry_total = task.entry_totals.get(index).copied().unwrap_or(source.size);

            let entry_failed = match self
                .transfer_entry(&mut task, source, &target_dir, is_move, processed_base, &mut speed)
                .await
            {
                Ok(()) => false,
                Err(error) => {
                    task.add_error(error);
                    true
                }
            };

            // Failed entries count as fully processed so the totals keep
            // moving; their error ends up on the task either way.
            processed_base += entry_total;
            task.set_processed(processed_base);
            task.num_remaining_items = sources.len() - (index + 1);
            speed.update(task.processed_bytes);

            if entry_failed {
                consecutive_errors += 1;
                if consecutive_errors >= self.inner.config.consecutive_error_limit {
                    warn!(
                        task = %task.id,
                        failures = consecutive_errors,
                        "aborting transfer after consecutive entry failures"
                    );
                    break;
                }
            } else {
                consecutive_errors = 0;
            }

            if index + 1 < sources.len() {
                self.emit_progress(&task, ProgressReason::Progress, None, &speed);
            }
        }

        self.finish_task(task, &speed);
    }

    /// Copy or move one source entry, relaying backend callbacks.
    async fn transfer_entry(
        &self,
        task: &mut Task,
        source: &Entry,
        target_dir: &Entry,
        is_move: bool,
        processed_base: u64,
        speed: &mut Speedometer,
    ) -> Result<(), OperationError> {
        let new_name = self
            .inner
            .resolver
            .deduplicate_path(target_dir, source.name())
            .await
            .map_err(|e| OperationError::new(source.url.clone(), e.to_string()))?;

        let mut rx = self
            .inner
            .backend
            .start_copy_or_move(source, target_dir, &new_name, is_move);

        let mut finished = false;
        while let Some(event) = rx.recv().await {
            match event {
                CopyEvent::Begin { .. } => {}
                CopyEvent::Progress { processed, .. } => {
                    task.set_processed(processed_base + processed);
                    speed.update(task.processed_bytes);
                    self.emit_progress(task, ProgressReason::Progress, None, speed);
                }
                CopyEvent::EntryCopied { entry, .. } => {
                    if is_move {
                        self.emit_entries_changed(EntryChangeKind::Deleted, vec![source.clone()]);
                    }
                    self.emit_entries_changed(EntryChangeKind::Created, vec![entry]);
                }
                CopyEvent::Success { .. } => {
                    finished = true;
                    break;
                }
                CopyEvent::Error { error } => {
                    return Err(OperationError::new(source.url.clone(), error.to_string()));
                }
            }
        }

        if finished {
            Ok(())
        } else {
            Err(OperationError::new(
                source.url.clone(),
                "backend closed the progress stream",
            ))
        }
    }

    /// Drive a delete task: entries are removed independently and failures
    /// are aggregated for the terminal event.
    async fn run_delete(&self, mut task: Task) {
        let speed = Speedometer::new(self.inner.config.speed_window);
        self.emit_progress(&task, ProgressReason::Begin, None, &speed);

        let entries = task.source_entries.clone();
        let mut processed = 0u64;
        for (index, entry) in entries.iter().enumerate() {
            match self.inner.backend.delete_entry(entry).await {
                Ok(()) => {
                    processed += task.entry_totals.get(index).copied().unwrap_or(entry.size);
                    task.set_processed(processed);
                }
                Err(error) => {
                    task.add_error(OperationError::new(entry.url.clone(), error.to_string()));
                }
            }
            task.num_remaining_items = entries.len() - (index + 1);
            if index + 1 < entries.len() {
                self.emit_progress(&task, ProgressReason::Progress, None, &speed);
            }
        }

        self.finish_task(task, &speed);
    }

    /// Drive a zip task: one backend call, entry-change on success, and the
    /// conservative 1-byte total corrected to the archive's real size.
    async fn run_zip(&self, mut task: Task) {
        let target_dir = task.target_dir.clone().expect("zip task without target");
        let speed = Speedometer::new(self.inner.config.speed_window);
        self.emit_progress(&task, ProgressReason::Begin, None, &speed);

        let desired = format!("{}.zip", archive_stem(&task.source_entries));
        let result = match self.inner.resolver.deduplicate_path(&target_dir, &desired).await {
            Ok(new_name) => {
                self.inner
                    .backend
                    .zip_selection(&task.source_entries, &target_dir, &new_name)
                    .await
                    .map_err(|e| OperationError::new(target_dir.url.clone(), e.to_string()))
            }
            Err(e) => Err(OperationError::new(target_dir.url.clone(), e.to_string())),
        };

        match result {
            Ok(archive) => {
                task.total_bytes = archive.size;
                task.num_remaining_items = 0;
                self.emit_entries_changed(EntryChangeKind::Created, vec![archive]);
            }
            Err(error) => task.add_error(error),
        }

        self.finish_task(task, &speed);
    }

    /// Mount once without a password; on `NeedPassword`, ask the prompt and
    /// retry once. `Ok(None)` means the user cancelled the prompt.
    async fn mount_with_retry(
        &self,
        prompt: &dyn PasswordPrompt,
        archive_url: &EntryUrl,
    ) -> Result<Option<VolumeHandle>, MountError> {
        match self.inner.backend.mount_archive(archive_url, None).await {
            Ok(handle) => Ok(Some(handle)),
            Err(MountError::NeedPassword) => {
                debug!(archive = %archive_url, "archive requires a password");
                let password = match prompt.ask_for_password(archive_url.name()).await {
                    Ok(password) => password,
                    Err(PromptError::Cancelled) => return Ok(None),
                };
                self.inner
                    .backend
                    .mount_archive(archive_url, Some(&password))
                    .await
                    .map(Some)
            }
            Err(error) => Err(error),
        }
    }

    /// Emit the terminal event, release the task's slots and start whatever
    /// the queue promotes for the freed volumes.
    fn finish_task(&self, mut task: Task, speed: &Speedometer) {
        let failed = task.has_errors();
        // Drop the task from the status board first, so that an observer of
        // the terminal event never finds the task still aggregated.
        self.untrack(task.id);
        if failed {
            let error = task.errors.last().cloned();
            self.emit_progress(&task, ProgressReason::Error, error, speed);
        } else {
            task.processed_bytes = task.total_bytes;
            task.num_remaining_items = 0;
            self.emit_progress(&task, ProgressReason::Success, None, speed);
        }

        let outcome = if failed { TaskState::Failed } else { TaskState::Succeeded };
        let promoted = self.inner.queue.complete(&mut task, outcome);
        info!(task = %task.id, kind = %task.kind, state = ?task.state, "task finished");

        for next in promoted {
            self.spawn_task(next);
        }
    }

    /// Report a destination whose volume cannot be resolved: the task emits
    /// exactly a begin and an error event and never touches the queue.
    fn fail_unresolvable_destination(&self, mut task: Task) -> TaskId {
        let url = task
            .target_dir
            .as_ref()
            .map(|dir| dir.url.clone())
            .unwrap_or_else(|| EntryUrl::new(""));
        warn!(task = %task.id, destination = %url, "destination volume is not available");

        let speed = Speedometer::new(self.inner.config.speed_window);
        task.begin_running();
        self.emit_progress(&task, ProgressReason::Begin, None, &speed);
        let error = OperationError::new(url, "destination volume is not available");
        task.add_error(error.clone());
        self.emit_progress(&task, ProgressReason::Error, Some(error), &speed);
        task.finish(TaskState::Failed);
        task.id
    }

    fn emit_progress(
        &self,
        task: &Task,
        reason: ProgressReason,
        error: Option<OperationError>,
        speed: &Speedometer,
    ) {
        let mut status = task.status();
        status.current_speed = speed.current_speed();
        status.average_speed = speed.average_speed();
        status.remaining_seconds = speed.remaining_seconds();
        self.refresh_board(task.id, &status);

        let event = match task.kind {
            TaskKind::Delete => FileOperationEvent::Delete {
                reason,
                task_id: task.id,
                status,
                error,
            },
            _ => FileOperationEvent::CopyProgress {
                reason,
                task_id: task.id,
                status,
                error,
            },
        };
        self.inner.router.send(event);
    }

    fn emit_entries_changed(&self, kind: EntryChangeKind, entries: Vec<Entry>) {
        self.inner
            .router
            .send(FileOperationEvent::EntriesChanged { kind, entries });
    }
}

/// Whether `entry` is a direct child of the directory at `dir`.
fn is_directly_inside(dir: &EntryUrl, entry: &EntryUrl) -> bool {
    let Some(rest) = entry.as_str().strip_prefix(dir.as_str()) else {
        return false;
    };
    let Some(name) = rest.strip_prefix('/') else {
        return false;
    };
    !name.is_empty() && !name.contains('/')
}

/// Base name for a zip archive: the single source's stem, or "Archive".
fn archive_stem(sources: &[Entry]) -> String {
    if let [only] = sources {
        let name = only.name();
        match name.rfind('.') {
            Some(idx) if idx > 0 => name[..idx].to_string(),
            _ => name.to_string(),
        }
    } else {
        "Archive".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_directly_inside() {
        let dir = EntryUrl::new("mem://vol/dest");
        assert!(is_directly_inside(&dir, &EntryUrl::new("mem://vol/dest/a.txt")));
        assert!(!is_directly_inside(&dir, &EntryUrl::new("mem://vol/dest/sub/a.txt")));
        assert!(!is_directly_inside(&dir, &EntryUrl::new("mem://vol/destination.txt")));
        assert!(!is_directly_inside(&dir, &EntryUrl::new("mem://vol/dest")));
        assert!(!is_directly_inside(&dir, &EntryUrl::new("mem://other/dest/a.txt")));
    }

    #[test]
    fn test_archive_stem() {
        let single = vec![Entry::file("mem://vol/photos.tar.gz", 1)];
        assert_eq!(archive_stem(&single), "photos.tar");

        let dotfile = vec![Entry::file("mem://vol/.config", 1)];
        assert_eq!(archive_stem(&dotfile), ".config");

        let many = vec![
            Entry::file("mem://vol/a.txt", 1),
            Entry::file("mem://vol/b.txt", 1),
        ];
        assert_eq!(archive_stem(&many), "Archive");
    }
}
