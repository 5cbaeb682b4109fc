//! Task bookkeeping for file operations.

use serde::{Deserialize, Serialize};

use crate::{Entry, OperationError};

/// Identifier assigned to each task at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file-operation-{}", self.0)
    }
}

/// The kind of user-requested operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Copy,
    Move,
    Zip,
    Delete,
    Mount,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "Copy"),
            Self::Move => write!(f, "Move"),
            Self::Zip => write!(f, "Zip"),
            Self::Delete => write!(f, "Delete"),
            Self::Mount => write!(f, "Mount"),
        }
    }
}

/// Lifecycle state of a task.
///
/// Legal transitions are exactly Pending -> Running -> Succeeded or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One user-requested file operation.
///
/// Created by the operation manager, admitted through the task queue and
/// mutated only by the runner driving it; other tasks never touch it.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique identifier, assigned at creation.
    pub id: TaskId,
    /// The operation this task performs.
    pub kind: TaskKind,
    /// Ordered source entries. Empty only for mounts.
    pub source_entries: Vec<Entry>,
    /// Destination directory. Absent for deletes and mounts.
    pub target_dir: Option<Entry>,
    /// Total bytes to process. Starts at 1 until sized, so that progress
    /// consumers never see a completed-looking 0/0 task.
    pub total_bytes: u64,
    /// Bytes processed so far. Never exceeds `total_bytes`.
    pub processed_bytes: u64,
    /// Source entries not yet fully processed.
    pub num_remaining_items: usize,
    /// Lifecycle state.
    pub state: TaskState,
    /// Per-entry byte totals computed before admission, aligned with
    /// `source_entries`.
    pub entry_totals: Vec<u64>,
    /// Errors accumulated while processing entries.
    pub errors: Vec<OperationError>,
}

impl Task {
    /// Create a pending task.
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        source_entries: Vec<Entry>,
        target_dir: Option<Entry>,
    ) -> Self {
        let num_remaining_items = source_entries.len();
        Self {
            id,
            kind,
            source_entries,
            target_dir,
            total_bytes: 1,
            processed_bytes: 0,
            num_remaining_items,
            state: TaskState::Pending,
            entry_totals: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Transition Pending -> Running. Any other starting state is a
    /// programming error.
    pub fn begin_running(&mut self) {
        assert_eq!(
            self.state,
            TaskState::Pending,
            "task {} started twice",
            self.id
        );
        self.state = TaskState::Running;
    }

    /// Transition Running -> terminal. Any other starting state, or a
    /// non-terminal target, is a programming error.
    pub fn finish(&mut self, outcome: TaskState) {
        assert!(outcome.is_terminal(), "task {} finish({outcome:?})", self.id);
        assert_eq!(
            self.state,
            TaskState::Running,
            "task {} finished while not running",
            self.id
        );
        self.state = outcome;
    }

    /// Record bytes processed, clamped so `processed_bytes` stays within
    /// `total_bytes`.
    pub fn set_processed(&mut self, bytes: u64) {
        self.processed_bytes = bytes.min(self.total_bytes);
    }

    /// Record an error against one of the task's entries.
    pub fn add_error(&mut self, error: OperationError) {
        self.errors.push(error);
    }

    /// Whether any entry of this task failed.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The source entry currently being processed, if any.
    pub fn processing_entry(&self) -> Option<&Entry> {
        let index = self
            .source_entries
            .len()
            .saturating_sub(self.num_remaining_items);
        self.source_entries.get(index)
    }

    /// Snapshot of the task's progress for event payloads. Speed fields are
    /// zero; the operation manager overlays live speedometer data.
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            kind: self.kind,
            num_remaining_items: self.num_remaining_items,
            processed_bytes: self.processed_bytes,
            total_bytes: self.total_bytes,
            processing_entry_name: self
                .processing_entry()
                .map(|e| e.name().to_string())
                .unwrap_or_default(),
            target_dir_name: self
                .target_dir
                .as_ref()
                .map(|e| e.name().to_string())
                .unwrap_or_default(),
            current_speed: 0,
            average_speed: 0,
            remaining_seconds: 0,
        }
    }
}

/// Progress snapshot carried in every task event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// The operation the task performs.
    pub kind: TaskKind,
    /// Source entries not yet fully processed.
    pub num_remaining_items: usize,
    /// Bytes processed so far.
    pub processed_bytes: u64,
    /// Total bytes to process.
    pub total_bytes: u64,
    /// Name of the entry currently being processed.
    pub processing_entry_name: String,
    /// Name of the destination directory, if any.
    pub target_dir_name: String,
    /// Recent transfer speed in bytes per second.
    pub current_speed: u64,
    /// Cumulative average speed in bytes per second.
    pub average_speed: u64,
    /// Estimated seconds until completion (0 when unknown).
    pub remaining_seconds: u64,
}
