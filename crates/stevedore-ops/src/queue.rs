//! Volume-affine task admission queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::debug;

use stevedore_core::{Task, TaskId, TaskKind, TaskState, VolumeId, VolumeResolver};

/// Outcome of submitting a task.
#[derive(Debug)]
pub enum Admission {
    /// All required volume slots were free; the task is now running and
    /// should be driven immediately.
    RunNow(Task),
    /// A running task holds a conflicting slot; the task waits in FIFO
    /// order and comes back through `complete`.
    Queued,
}

#[derive(Default)]
struct QueueState {
    /// Slot holders: at most one running task per destination volume.
    slots: IndexMap<VolumeId, TaskId>,
    /// Affinity of each running task, kept for release on completion.
    running: IndexMap<TaskId, Vec<VolumeId>>,
    /// Pending tasks with their affinity, in submission order.
    pending: IndexMap<TaskId, (Task, Vec<VolumeId>)>,
    /// FIFO of pending task ids per contended volume.
    waitlists: IndexMap<VolumeId, VecDeque<TaskId>>,
}

/// Decides whether a submitted task may start immediately or must wait for
/// the volume it targets.
///
/// Tasks targeting the same destination volume run strictly in submission
/// order; tasks on distinct volumes are never serialized against each other.
/// The whole admit/complete/promote sequence is guarded by one mutex, so the
/// queue is safe to drive from any thread or runtime worker.
pub struct TaskQueue {
    volumes: Arc<dyn VolumeResolver>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// Create a queue resolving volume affinity through `volumes`.
    pub fn new(volumes: Arc<dyn VolumeResolver>) -> Self {
        Self {
            volumes,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Destination-volume affinity of a task: the target directory's volume
    /// for transfers and zips, every distinct source volume for deletes
    /// (conservative), nothing for mounts. Volumes the resolver cannot
    /// identify contribute no slot.
    fn affinity(&self, task: &Task) -> Vec<VolumeId> {
        match task.kind {
            TaskKind::Copy | TaskKind::Move | TaskKind::Zip => task
                .target_dir
                .as_ref()
                .and_then(|dir| self.volumes.volume_id(dir))
                .into_iter()
                .collect(),
            TaskKind::Delete => {
                let mut touched = Vec::new();
                for entry in &task.source_entries {
                    if let Some(volume) = self.volumes.volume_id(entry) {
                        if !touched.contains(&volume) {
                            touched.push(volume);
                        }
                    }
                }
                touched
            }
            TaskKind::Mount => Vec::new(),
        }
    }

    /// Admit `task` if no running task holds a conflicting slot, otherwise
    /// append it to the waitlist of each volume it needs.
    pub fn submit(&self, mut task: Task) -> Admission {
        assert_eq!(
            task.state,
            TaskState::Pending,
            "task {} submitted while not pending",
            task.id
        );
        let affinity = self.affinity(&task);
        let mut state = self.lock();
        assert!(
            !state.running.contains_key(&task.id) && !state.pending.contains_key(&task.id),
            "task {} submitted twice",
            task.id
        );

        if affinity.iter().any(|v| state.slots.contains_key(v)) {
            debug!(task = %task.id, "queued behind a running task");
            for volume in &affinity {
                state
                    .waitlists
                    .entry(volume.clone())
                    .or_default()
                    .push_back(task.id);
            }
            state.pending.insert(task.id, (task, affinity));
            Admission::Queued
        } else {
            Self::admit(&mut state, &mut task, affinity);
            Admission::RunNow(task)
        }
    }

    /// Transition `task` to its terminal state, release its slots, and
    /// promote at most one eligible pending task per freed volume. Promoted
    /// tasks are returned already running, for the caller to drive.
    ///
    /// A failed task frees its volume like any other: the next pending task
    /// for that volume is promoted regardless of the outcome.
    pub fn complete(&self, task: &mut Task, outcome: TaskState) -> Vec<Task> {
        let mut state = self.lock();
        let affinity = state
            .running
            .shift_remove(&task.id)
            .unwrap_or_else(|| panic!("completing task {} that is not running", task.id));
        for volume in &affinity {
            let holder = state.slots.shift_remove(volume);
            assert_eq!(holder, Some(task.id), "slot for {volume} held by another task");
        }
        task.finish(outcome);
        debug!(task = %task.id, state = ?task.state, "task completed");

        let mut promoted = Vec::new();
        for volume in &affinity {
            let Some(next_id) = state.waitlists.get(volume).and_then(|q| q.front()).copied()
            else {
                continue;
            };
            let eligible = {
                let (_, next_affinity) = &state.pending[&next_id];
                !next_affinity.iter().any(|v| state.slots.contains_key(v))
            };
            if !eligible {
                continue;
            }

            let (mut next, next_affinity) = state
                .pending
                .shift_remove(&next_id)
                .expect("waitlisted task missing from pending set");
            for v in &next_affinity {
                if let Some(queue) = state.waitlists.get_mut(v) {
                    queue.retain(|id| *id != next_id);
                }
            }
            Self::admit(&mut state, &mut next, next_affinity);
            debug!(task = %next.id, "promoted from waitlist");
            promoted.push(next);
        }
        promoted
    }

    /// Pending tasks waiting on `volume`, in FIFO order.
    pub fn pending_tasks_for_volume(&self, volume: &VolumeId) -> Vec<Task> {
        let state = self.lock();
        state
            .waitlists
            .get(volume)
            .map(|queue| {
                queue
                    .iter()
                    .map(|id| state.pending[id].0.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every pending task, in submission order.
    pub fn all_pending_tasks(&self) -> Vec<Task> {
        self.lock()
            .pending
            .values()
            .map(|(task, _)| task.clone())
            .collect()
    }

    /// Number of tasks currently running.
    pub fn running_task_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Whether any task is running or pending.
    pub fn has_queued_tasks(&self) -> bool {
        let state = self.lock();
        !state.running.is_empty() || !state.pending.is_empty()
    }

    fn admit(state: &mut QueueState, task: &mut Task, affinity: Vec<VolumeId>) {
        for volume in &affinity {
            let previous = state.slots.insert(volume.clone(), task.id);
            assert!(previous.is_none(), "slot for {volume} double-acquired");
        }
        state.running.insert(task.id, affinity);
        task.begin_running();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("task queue mutex poisoned")
    }
}
