//! In-memory storage fakes for stevedore tests.
//!
//! [`MemoryBackend`] implements the full backend surface over a per-volume
//! path map, with hooks for blocking copies mid-flight, forcing failures and
//! scripting archive mounts. The companion fakes cover the remaining
//! injected collaborators: [`UrlVolumeResolver`], [`ScriptedPrompt`] and
//! [`RecordingTracker`].

mod memory;
mod prompt;
mod tracker;
mod volumes;

pub use memory::{CopyGate, MemoryBackend};
pub use prompt::ScriptedPrompt;
pub use tracker::RecordingTracker;
pub use volumes::UrlVolumeResolver;
