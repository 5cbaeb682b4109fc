//! Recording navigation tracker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use stevedore_core::{ChangeTracker, Entry};

/// Change tracker that counts simulated navigations and records every
/// directory switch requested by the mount flow.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    generation: AtomicU64,
    changes: Mutex<Vec<Entry>>,
}

impl RecordingTracker {
    /// Create a tracker with no navigations recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user navigating somewhere else.
    pub fn navigate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Directories the mount flow switched to, in order.
    pub fn changed_to(&self) -> Vec<Entry> {
        self.changes.lock().expect("changes poisoned").clone()
    }
}

impl ChangeTracker for RecordingTracker {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn change_directory(&self, entry: &Entry) {
        self.changes
            .lock()
            .expect("changes poisoned")
            .push(entry.clone());
    }
}
