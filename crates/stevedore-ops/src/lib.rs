//! File operation engine for stevedore.
//!
//! The [`OperationManager`] accepts copy, move, zip, delete and
//! archive-mount requests, admits them through a per-destination-volume
//! [`TaskQueue`], delegates byte-level work to the injected storage backend
//! and re-emits normalized progress events on a broadcast channel.
//!
//! Tasks contending for the same destination volume run strictly in
//! submission order; tasks on distinct volumes run concurrently.

mod error;
mod events;
mod manager;
mod queue;
mod speed;

pub use error::OpsError;
pub use events::{EntryChangeKind, EventRouter, FileOperationEvent, ProgressReason};
pub use manager::{AggregateStatus, OperationManager};
pub use queue::{Admission, TaskQueue};
pub use speed::Speedometer;
