//! Core types and traits for stevedore.
//!
//! This crate provides the fundamental data structures shared across the
//! stevedore ecosystem: storage entry handles, task bookkeeping, the error
//! taxonomy, configuration, and the collaborator capabilities (storage
//! backend, volume resolver, password prompt) injected into the operation
//! manager.

mod backend;
mod config;
mod entry;
mod error;
mod task;

pub use backend::{
    ChangeTracker, CopyEvent, EntryReader, PasswordPrompt, StorageBackend, VolumeResolver,
};
pub use config::{OpsConfig, OpsConfigBuilder};
pub use entry::{Entry, EntryUrl, VolumeHandle, VolumeId};
pub use error::{BackendError, MountError, OperationError, PromptError, ResolveError};
pub use task::{Task, TaskId, TaskKind, TaskState, TaskStatus};
