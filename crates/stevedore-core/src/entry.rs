//! Storage entry handles and volume identifiers.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Unique identifier of an entry on some volume.
///
/// The URL format is owned by the storage backend; stevedore treats it as an
/// opaque string and only derives display names from the final segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryUrl(String);

impl EntryUrl {
    /// Create an entry URL from its string form.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// The URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path segment, used as the entry's display name.
    pub fn name(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }
}

impl std::fmt::Display for EntryUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryUrl {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for EntryUrl {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Handle to a file or directory on a volume.
///
/// Entries are immutable once resolved: operations never mutate a handle,
/// they only produce new ones for the entries they create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier of the entry.
    pub url: EntryUrl,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Size in bytes. Meaningful for files; directories report 0.
    pub size: u64,
}

impl Entry {
    /// Create a file entry.
    pub fn file(url: impl Into<EntryUrl>, size: u64) -> Self {
        Self {
            url: url.into(),
            is_directory: false,
            size,
        }
    }

    /// Create a directory entry.
    pub fn directory(url: impl Into<EntryUrl>) -> Self {
        Self {
            url: url.into(),
            is_directory: true,
            size: 0,
        }
    }

    /// The entry's display name (final URL segment).
    pub fn name(&self) -> &str {
        self.url.name()
    }
}

/// Identifier of a storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(CompactString);

impl VolumeId {
    /// Create a volume identifier.
    pub fn new(id: impl Into<CompactString>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A mounted volume: its identifier plus its root directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub volume_id: VolumeId,
    pub root: Entry,
}
