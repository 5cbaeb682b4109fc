use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use stevedore_core::{
    Entry, EntryUrl, OpsConfig, PasswordPrompt, PromptError, StorageBackend, TaskId, TaskKind,
    VolumeId,
};
use stevedore_ops::{EntryChangeKind, FileOperationEvent, OperationManager, OpsError, ProgressReason};
use stevedore_testing::{MemoryBackend, RecordingTracker, ScriptedPrompt, UrlVolumeResolver};

fn manager_with_config(
    backend: &MemoryBackend,
    volumes: Arc<UrlVolumeResolver>,
    config: OpsConfig,
) -> OperationManager {
    OperationManager::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        volumes,
        config,
    )
}

fn manager(backend: &MemoryBackend, volumes: Arc<UrlVolumeResolver>) -> OperationManager {
    manager_with_config(backend, volumes, OpsConfig::default())
}

async fn next_event(rx: &mut broadcast::Receiver<FileOperationEvent>) -> FileOperationEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

fn is_terminal(event: &FileOperationEvent) -> bool {
    matches!(
        event.reason(),
        Some(ProgressReason::Success | ProgressReason::Error)
    )
}

/// Drain events until `count` terminal (success or error) progress events
/// have been seen.
async fn collect_until_terminals(
    rx: &mut broadcast::Receiver<FileOperationEvent>,
    count: usize,
) -> Vec<FileOperationEvent> {
    let mut events = Vec::new();
    let mut seen = 0;
    while seen < count {
        let event = next_event(rx).await;
        if is_terminal(&event) {
            seen += 1;
        }
        events.push(event);
    }
    events
}

async fn assert_no_more_events(rx: &mut broadcast::Receiver<FileOperationEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected trailing event");
}

fn position<F>(events: &[FileOperationEvent], predicate: F) -> usize
where
    F: Fn(&FileOperationEvent) -> bool,
{
    events
        .iter()
        .position(predicate)
        .expect("expected event not found")
}

fn progress_of(event: &FileOperationEvent, task: TaskId, reason: ProgressReason) -> bool {
    event.task_id() == Some(task) && event.reason() == Some(reason)
}

fn created_name(event: &FileOperationEvent) -> Option<&str> {
    match event {
        FileOperationEvent::EntriesChanged {
            kind: EntryChangeKind::Created,
            entries,
        } => entries.first().map(|e| e.name()),
        _ => None,
    }
}

#[tokio::test]
async fn copy_reports_begin_progress_success_with_exact_bytes() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    let id = mgr.paste(vec![test], dest, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;

    let FileOperationEvent::CopyProgress { reason, task_id, status, .. } = &events[0] else {
        panic!("first event should be copy progress");
    };
    assert_eq!(*reason, ProgressReason::Begin);
    assert_eq!(*task_id, id);
    assert_eq!(status.kind, TaskKind::Copy);
    assert_eq!(status.total_bytes, 10);
    assert_eq!(status.processed_bytes, 0);
    assert_eq!(status.num_remaining_items, 1);

    let FileOperationEvent::CopyProgress { reason, status, .. } = events.last().unwrap() else {
        panic!("last event should be copy progress");
    };
    assert_eq!(*reason, ProgressReason::Success);
    assert_eq!(status.processed_bytes, 10);
    assert_eq!(status.total_bytes, 10);
    assert_eq!(status.num_remaining_items, 0);

    assert!(backend.exists("vol", "dest/test.txt"));
    assert!(events.iter().any(|e| created_name(e) == Some("test.txt")));
    assert!(!events.iter().any(|e| e.kind() == "delete"));
}

#[tokio::test]
async fn copy_into_the_source_directory_deduplicates_the_name() {
    let backend = MemoryBackend::new();
    let root = backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    mgr.paste(vec![test], root, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    assert!(events.iter().any(|e| created_name(e) == Some("test (1).txt")));
    assert!(backend.exists("vol", "test.txt"));
    assert!(backend.exists("vol", "test (1).txt"));
}

#[tokio::test]
async fn copy_of_a_directory_accounts_descendant_bytes() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let album = backend.add_directory("vol", "album");
    backend.add_file("vol", "album/a.jpg", 10);
    backend.add_file("vol", "album/b.jpg", 20);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    mgr.paste(vec![album], dest, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let FileOperationEvent::CopyProgress { status, .. } = events.last().unwrap() else {
        panic!("last event should be copy progress");
    };
    assert_eq!(status.total_bytes, 30);
    assert_eq!(status.processed_bytes, 30);

    assert!(backend.exists("vol", "dest/album"));
    assert!(backend.exists("vol", "dest/album/a.jpg"));
    assert!(backend.exists("vol", "dest/album/b.jpg"));
}

#[tokio::test]
async fn move_emits_deleted_then_created_and_removes_the_source() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    mgr.paste(vec![test.clone()], dest, true).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let deleted = position(&events, |e| {
        matches!(
            e,
            FileOperationEvent::EntriesChanged {
                kind: EntryChangeKind::Deleted,
                entries,
            } if entries.first() == Some(&test)
        )
    });
    let created = position(&events, |e| created_name(e) == Some("test.txt"));
    assert!(deleted < created, "deleted must precede created");

    assert!(!backend.exists("vol", "test.txt"));
    assert!(backend.exists("vol", "dest/test.txt"));
}

#[tokio::test]
async fn moving_entries_already_in_the_target_is_a_noop() {
    let backend = MemoryBackend::new();
    let root = backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    let id = mgr.paste(vec![test], root, true).await.unwrap();
    assert_eq!(id, None);
    assert!(!mgr.has_active_tasks());
    assert_no_more_events(&mut rx).await;
    assert!(backend.exists("vol", "test.txt"));
}

#[tokio::test]
async fn pasting_into_a_file_is_rejected() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let not_a_dir = backend.add_file("vol", "target.bin", 1);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let err = mgr.paste(vec![test], not_a_dir, false).await.unwrap_err();
    assert!(matches!(err, OpsError::NotADirectory { .. }));
}

#[tokio::test]
async fn tasks_on_the_same_volume_run_in_submission_order() {
    let backend = MemoryBackend::new();
    let root = backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let gate = backend.block_destination("mem://vol/dest/");
    let mut rx = mgr.subscribe();

    let first = mgr
        .paste(vec![test.clone()], dest, false)
        .await
        .unwrap()
        .unwrap();
    gate.wait_blocked().await;

    // Same destination volume: the second task must wait.
    let second = mgr.paste(vec![test], root, false).await.unwrap().unwrap();
    assert_eq!(mgr.all_pending_tasks().len(), 1);
    assert_eq!(
        mgr.pending_tasks_for_volume(&VolumeId::new("vol"))
            .first()
            .map(|t| t.id),
        Some(second)
    );

    gate.release();
    let events = collect_until_terminals(&mut rx, 2).await;

    let first_done = position(&events, |e| {
        progress_of(e, first, ProgressReason::Success)
    });
    let second_begin = position(&events, |e| {
        progress_of(e, second, ProgressReason::Begin)
    });
    assert!(
        second_begin > first_done,
        "the queued task must not begin before its predecessor finishes"
    );
    assert!(mgr.all_pending_tasks().is_empty());
}

#[tokio::test]
async fn tasks_on_different_volumes_run_in_parallel() {
    let backend = MemoryBackend::new();
    let root_a = backend.add_volume("a");
    backend.add_volume("b");
    let test = backend.add_file("a", "test.txt", 10);
    let dest_b = backend.entry("b", "").unwrap();
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let gate = backend.block_destination("mem://b/");
    let mut rx = mgr.subscribe();

    let blocked = mgr
        .paste(vec![test.clone()], dest_b, false)
        .await
        .unwrap()
        .unwrap();
    gate.wait_blocked().await;

    // Different destination volume: runs without waiting for the first.
    let free = mgr.paste(vec![test], root_a, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let terminal = events.iter().rfind(|e| is_terminal(e)).unwrap();
    assert_eq!(terminal.task_id(), Some(free));
    assert_eq!(terminal.reason(), Some(ProgressReason::Success));

    gate.release();
    let rest = collect_until_terminals(&mut rx, 1).await;
    let terminal = rest.iter().rfind(|e| is_terminal(e)).unwrap();
    assert_eq!(terminal.task_id(), Some(blocked));
}

#[tokio::test]
async fn pasting_into_an_unavailable_volume_emits_begin_then_error_only() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let test = backend.add_file("vol", "test.txt", 10);
    let dest = backend.add_directory("vol", "dest");
    let volumes = Arc::new(UrlVolumeResolver::new());
    volumes.mark_unavailable("vol");
    let mgr = manager(&backend, volumes);

    let mut rx = mgr.subscribe();
    let id = mgr.paste(vec![test], dest, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    assert_eq!(events.len(), 2, "expected exactly begin and error");
    assert!(progress_of(&events[0], id, ProgressReason::Begin));
    assert!(progress_of(&events[1], id, ProgressReason::Error));
    let FileOperationEvent::CopyProgress { error, .. } = &events[1] else {
        panic!("error event should be copy progress");
    };
    assert!(error.is_some());

    assert_no_more_events(&mut rx).await;
    assert!(mgr.all_pending_tasks().is_empty());
    assert!(!mgr.has_active_tasks());
}

#[tokio::test]
async fn a_failed_task_does_not_block_tasks_queued_behind_it() {
    let backend = MemoryBackend::new();
    let root = backend.add_volume("vol");
    let ghost = backend.add_file("vol", "ghost.txt", 10);
    let test = backend.add_file("vol", "test.txt", 10);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let gate = backend.block_destination("mem://vol/dest/");
    let mut rx = mgr.subscribe();

    let doomed = mgr
        .paste(vec![ghost.clone()], dest, false)
        .await
        .unwrap()
        .unwrap();
    gate.wait_blocked().await;

    let queued = mgr.paste(vec![test], root, false).await.unwrap().unwrap();

    // Pull the source out from under the blocked copy, then let it run.
    backend.delete_entry(&ghost).await.unwrap();
    gate.release();

    let events = collect_until_terminals(&mut rx, 2).await;
    let failed = position(&events, |e| progress_of(e, doomed, ProgressReason::Error));
    let begin = position(&events, |e| progress_of(e, queued, ProgressReason::Begin));
    let succeeded = position(&events, |e| {
        progress_of(e, queued, ProgressReason::Success)
    });
    assert!(failed < begin && begin < succeeded);
}

#[tokio::test]
async fn delete_emits_delete_events_with_flat_totals() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let a = backend.add_file("vol", "a.txt", 10);
    let b = backend.add_file("vol", "b.txt", 20);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    let id = mgr.delete_entries(vec![a, b]).unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    for event in &events {
        assert_eq!(event.kind(), "delete", "deletes emit only delete events");
        assert_eq!(event.task_id(), Some(id));
    }

    let FileOperationEvent::Delete { reason, status, .. } = &events[0] else {
        panic!("expected a delete event");
    };
    assert_eq!(*reason, ProgressReason::Begin);
    assert_eq!(status.total_bytes, 30);
    assert_eq!(status.num_remaining_items, 2);

    let FileOperationEvent::Delete { reason, status, .. } = events.last().unwrap() else {
        panic!("expected a delete event");
    };
    assert_eq!(*reason, ProgressReason::Success);
    assert_eq!(status.processed_bytes, 30);
    assert_eq!(status.num_remaining_items, 0);

    assert!(!backend.exists("vol", "a.txt"));
    assert!(!backend.exists("vol", "b.txt"));
}

#[tokio::test]
async fn delete_failures_do_not_stop_sibling_entries() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let a = backend.add_file("vol", "a.txt", 10);
    let missing = Entry::file("mem://vol/missing.txt", 5);
    let b = backend.add_file("vol", "b.txt", 20);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    mgr.delete_entries(vec![a, missing, b]).unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let FileOperationEvent::Delete { reason, error, .. } = events.last().unwrap() else {
        panic!("expected a delete event");
    };
    assert_eq!(*reason, ProgressReason::Error);
    assert!(error.as_ref().unwrap().message.contains("not found"));

    // Both real entries went away despite the failure in between.
    assert!(!backend.exists("vol", "a.txt"));
    assert!(!backend.exists("vol", "b.txt"));
}

#[tokio::test]
async fn zip_begins_at_one_byte_and_corrects_to_the_archive_size() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let a = backend.add_file("vol", "a.txt", 10);
    let b = backend.add_file("vol", "b.txt", 20);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    let id = mgr.zip_selection(vec![a, b], dest).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let FileOperationEvent::CopyProgress { reason, status, task_id, .. } = &events[0] else {
        panic!("first event should be copy progress");
    };
    assert_eq!(*reason, ProgressReason::Begin);
    assert_eq!(*task_id, id);
    assert_eq!(status.kind, TaskKind::Zip);
    assert_eq!(status.total_bytes, 1);

    let FileOperationEvent::CopyProgress { reason, status, .. } = events.last().unwrap() else {
        panic!("last event should be copy progress");
    };
    assert_eq!(*reason, ProgressReason::Success);
    assert_eq!(status.total_bytes, 30);
    assert_eq!(status.processed_bytes, 30);

    assert!(events.iter().any(|e| created_name(e) == Some("Archive.zip")));
    assert_eq!(backend.entry("vol", "dest/Archive.zip").unwrap().size, 30);
}

#[tokio::test]
async fn zip_of_a_single_source_is_named_after_its_stem() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let photo = backend.add_file("vol", "photo.jpg", 10);
    let dest = backend.add_directory("vol", "dest");
    // A previous archive forces the counter scheme.
    backend.add_file("vol", "dest/photo.zip", 1);
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let mut rx = mgr.subscribe();
    mgr.zip_selection(vec![photo], dest).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    assert!(events.iter().any(|e| created_name(e) == Some("photo (1).zip")));
    assert!(backend.exists("vol", "dest/photo (1).zip"));
}

#[tokio::test]
async fn consecutive_entry_failures_abort_the_task() {
    let backend = MemoryBackend::new();
    backend.add_volume("vol");
    let files: Vec<Entry> = (0..5)
        .map(|i| backend.add_file("vol", &format!("f{i}.txt"), 10))
        .collect();
    let dest = backend.add_directory("vol", "dest");
    let config = OpsConfig::builder()
        .consecutive_error_limit(2usize)
        .build()
        .unwrap();
    let mgr = manager_with_config(&backend, Arc::new(UrlVolumeResolver::new()), config);

    backend.fail_all_copies(true);
    let mut rx = mgr.subscribe();
    mgr.paste(files, dest, false).await.unwrap().unwrap();

    let events = collect_until_terminals(&mut rx, 1).await;
    let FileOperationEvent::CopyProgress { reason, status, .. } = events.last().unwrap() else {
        panic!("last event should be copy progress");
    };
    assert_eq!(*reason, ProgressReason::Error);
    // Aborted after the second failure; three entries were never attempted.
    assert_eq!(status.num_remaining_items, 3);
}

#[tokio::test]
async fn mount_retries_once_with_the_prompted_password() {
    let backend = MemoryBackend::new();
    let url = EntryUrl::new("mem://downloads/secret.zip");
    backend.script_mount(url.as_str(), Some("hunter2"), "archive");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let tracker = RecordingTracker::new();
    let prompt = ScriptedPrompt::new();
    prompt.push_password("hunter2");

    mgr.mount_archive_and_change_directory(&tracker, &prompt, url.clone())
        .await
        .unwrap();

    assert_eq!(prompt.asked(), vec!["secret.zip"]);
    assert_eq!(
        backend.mount_attempts(),
        vec![
            (url.to_string(), None),
            (url.to_string(), Some("hunter2".to_string())),
        ]
    );
    let changes = tracker.changed_to();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].url.as_str(), "mem://archive");
    assert!(!mgr.has_active_tasks());
}

#[tokio::test]
async fn cancelling_the_password_prompt_abandons_the_mount_silently() {
    let backend = MemoryBackend::new();
    let url = EntryUrl::new("mem://downloads/secret.zip");
    backend.script_mount(url.as_str(), Some("hunter2"), "archive");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let tracker = RecordingTracker::new();
    let prompt = ScriptedPrompt::new();
    prompt.push_cancel();

    mgr.mount_archive_and_change_directory(&tracker, &prompt, url.clone())
        .await
        .unwrap();

    // No retry after the cancelled prompt, and no directory change.
    assert_eq!(backend.mount_attempts().len(), 1);
    assert!(tracker.changed_to().is_empty());
}

/// Prompt that simulates the user navigating away while the password dialog
/// is open.
struct NavigatingPrompt<'a> {
    tracker: &'a RecordingTracker,
    password: String,
}

#[async_trait]
impl PasswordPrompt for NavigatingPrompt<'_> {
    async fn ask_for_password(&self, _filename: &str) -> Result<String, PromptError> {
        self.tracker.navigate();
        Ok(self.password.clone())
    }
}

#[tokio::test]
async fn mount_does_not_clobber_a_navigation_made_meanwhile() {
    let backend = MemoryBackend::new();
    let url = EntryUrl::new("mem://downloads/secret.zip");
    backend.script_mount(url.as_str(), Some("hunter2"), "archive");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let tracker = RecordingTracker::new();
    let prompt = NavigatingPrompt {
        tracker: &tracker,
        password: "hunter2".to_string(),
    };

    mgr.mount_archive_and_change_directory(&tracker, &prompt, url)
        .await
        .unwrap();

    // The mount succeeded, but the user went elsewhere: leave them be.
    assert_eq!(backend.mount_attempts().len(), 2);
    assert!(tracker.changed_to().is_empty());
}

#[tokio::test]
async fn unknown_archives_fail_terminally_keyed_by_url() {
    let backend = MemoryBackend::new();
    let url = EntryUrl::new("mem://downloads/bogus.zip");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let tracker = RecordingTracker::new();
    let prompt = ScriptedPrompt::new();

    let err = mgr
        .mount_archive_and_change_directory(&tracker, &prompt, url.clone())
        .await
        .unwrap_err();
    let OpsError::Mount { url: reported, .. } = err else {
        panic!("expected a mount error");
    };
    assert_eq!(reported, url.to_string());
    assert!(tracker.changed_to().is_empty());
    assert!(!mgr.has_active_tasks());
}

#[tokio::test]
async fn aggregate_status_spans_running_and_pending_tasks() {
    let backend = MemoryBackend::new();
    let root = backend.add_volume("vol");
    let small = backend.add_file("vol", "small.txt", 10);
    let large = backend.add_file("vol", "large.txt", 20);
    let dest = backend.add_directory("vol", "dest");
    let mgr = manager(&backend, Arc::new(UrlVolumeResolver::new()));

    let gate = backend.block_destination("mem://vol/dest/");
    let mut rx = mgr.subscribe();

    mgr.paste(vec![small], dest, false).await.unwrap().unwrap();
    gate.wait_blocked().await;
    let pending = mgr.paste(vec![large], root, false).await.unwrap().unwrap();

    let aggregate = mgr.aggregate_status();
    assert_eq!(aggregate.num_tasks, 2);
    assert_eq!(aggregate.total_bytes, 30);
    assert_eq!(aggregate.num_remaining_items, 2);
    assert!(mgr.has_active_tasks());

    let waiting = mgr.task_status(pending).expect("pending task has a status");
    assert_eq!(waiting.total_bytes, 20);
    assert_eq!(waiting.processed_bytes, 0);

    gate.release();
    collect_until_terminals(&mut rx, 2).await;

    let aggregate = mgr.aggregate_status();
    assert_eq!(aggregate.num_tasks, 0);

    // Queue bookkeeping settles just after the terminal events.
    timeout(Duration::from_secs(5), async {
        while mgr.has_active_tasks() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("queue did not drain");
}
