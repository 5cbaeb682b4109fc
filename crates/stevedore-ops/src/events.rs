//! Event stream surfaced to UI collaborators.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use stevedore_core::{Entry, OperationError, TaskId, TaskStatus};

/// Phase of a task reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressReason {
    Begin,
    Progress,
    Success,
    Error,
}

/// Whether changed entries appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryChangeKind {
    Created,
    Deleted,
}

/// Events emitted by the operation manager.
///
/// `CopyProgress` covers copy, move and zip tasks; `Delete` has the same
/// shape under a distinct event so consumers can route it separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FileOperationEvent {
    CopyProgress {
        reason: ProgressReason,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<OperationError>,
    },
    Delete {
        reason: ProgressReason,
        task_id: TaskId,
        status: TaskStatus,
        error: Option<OperationError>,
    },
    EntriesChanged {
        kind: EntryChangeKind,
        entries: Vec<Entry>,
    },
}

impl FileOperationEvent {
    /// Machine-friendly discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CopyProgress { .. } => "copy-progress",
            Self::Delete { .. } => "delete",
            Self::EntriesChanged { .. } => "entries-changed",
        }
    }

    /// The progress reason, for progress-shaped events.
    pub fn reason(&self) -> Option<ProgressReason> {
        match self {
            Self::CopyProgress { reason, .. } | Self::Delete { reason, .. } => Some(*reason),
            Self::EntriesChanged { .. } => None,
        }
    }

    /// The task the event belongs to, for progress-shaped events.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::CopyProgress { task_id, .. } | Self::Delete { task_id, .. } => Some(*task_id),
            Self::EntriesChanged { .. } => None,
        }
    }
}

/// Fan-out router for operation events.
///
/// Built on `tokio::broadcast`: slow subscribers lose the oldest events
/// rather than stalling the operation pipeline.
#[derive(Debug, Clone)]
pub struct EventRouter {
    tx: broadcast::Sender<FileOperationEvent>,
}

impl EventRouter {
    /// Create a router with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<FileOperationEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn stream(&self) -> BroadcastStream<FileOperationEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit an event. Delivery to zero subscribers is not an error.
    pub(crate) fn send(&self, event: FileOperationEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::TaskKind;

    fn status() -> TaskStatus {
        TaskStatus {
            kind: TaskKind::Copy,
            num_remaining_items: 1,
            processed_bytes: 5,
            total_bytes: 10,
            processing_entry_name: "a.txt".to_string(),
            target_dir_name: "dest".to_string(),
            current_speed: 0,
            average_speed: 0,
            remaining_seconds: 0,
        }
    }

    #[test]
    fn test_event_accessors() {
        let event = FileOperationEvent::CopyProgress {
            reason: ProgressReason::Begin,
            task_id: TaskId(1),
            status: status(),
            error: None,
        };
        assert_eq!(event.kind(), "copy-progress");
        assert_eq!(event.reason(), Some(ProgressReason::Begin));
        assert_eq!(event.task_id(), Some(TaskId(1)));

        let changed = FileOperationEvent::EntriesChanged {
            kind: EntryChangeKind::Created,
            entries: vec![],
        };
        assert_eq!(changed.kind(), "entries-changed");
        assert_eq!(changed.reason(), None);
        assert_eq!(changed.task_id(), None);
    }

    #[test]
    fn test_router_delivers_to_subscribers() {
        let router = EventRouter::new(4);
        let mut rx = router.subscribe();
        let event = FileOperationEvent::Delete {
            reason: ProgressReason::Success,
            task_id: TaskId(2),
            status: status(),
            error: None,
        };
        router.send(event.clone());
        assert_eq!(rx.try_recv().unwrap(), event);
    }

    #[test]
    fn test_event_serializes_with_kebab_case_tag() {
        let event = FileOperationEvent::EntriesChanged {
            kind: EntryChangeKind::Created,
            entries: vec![Entry::file("mem://vol/a.txt", 3)],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"entries-changed\""));
    }
}
