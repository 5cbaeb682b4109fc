//! Entry resolution and directory traversal.

use std::collections::HashSet;
use std::sync::Arc;

use stevedore_core::{Entry, EntryReader, ResolveError};

use crate::dedup::split_name;

/// Resolves paths to entries, enumerates directory trees and deduplicates
/// destination names through the read side of a storage backend.
///
/// Every call is self-contained: traversals keep no shared iterator state,
/// so callers can run them concurrently or restart them freely.
#[derive(Clone)]
pub struct PathResolver {
    reader: Arc<dyn EntryReader>,
}

impl PathResolver {
    /// Create a resolver over the given reader.
    pub fn new(reader: Arc<dyn EntryReader>) -> Self {
        Self { reader }
    }

    /// Resolve `relative_path` under `root`, walking one segment at a time.
    ///
    /// An empty path (or "/") resolves to the root itself. Whatever the
    /// terminal segment turns out to be, file or directory, is returned
    /// as-is. Fails with [`ResolveError::NotFound`] on the first missing
    /// segment.
    pub async fn resolve_path(&self, root: &Entry, relative_path: &str) -> Result<Entry, ResolveError> {
        let mut current = root.clone();
        for segment in relative_path.split('/').filter(|s| !s.is_empty()) {
            current = self.reader.child(&current, segment).await?;
        }
        Ok(current)
    }

    /// Depth-first traversal of the subtree under `root`, root exclusive.
    /// `visit` is called once per discovered entry, directories included.
    ///
    /// Files make the traversal a no-op. Cycle detection is the backend's
    /// responsibility; directory graphs are assumed acyclic.
    pub async fn find_entries_recursively<F>(&self, root: &Entry, mut visit: F) -> Result<(), ResolveError>
    where
        F: FnMut(&Entry),
    {
        if !root.is_directory {
            return Ok(());
        }

        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let children = self.reader.read_children(&dir).await?;
            let mut subdirs = Vec::new();
            for child in &children {
                visit(child);
                if child.is_directory {
                    subdirs.push(child.clone());
                }
            }
            // Reverse so the first subdirectory is explored next.
            stack.extend(subdirs.into_iter().rev());
        }
        Ok(())
    }

    /// Like [`find_entries_recursively`](Self::find_entries_recursively),
    /// but only files reach `visit`.
    pub async fn find_files_recursively<F>(&self, root: &Entry, mut visit: F) -> Result<(), ResolveError>
    where
        F: FnMut(&Entry),
    {
        self.find_entries_recursively(root, |entry| {
            if !entry.is_directory {
                visit(entry);
            }
        })
        .await
    }

    /// Collect every entry under `root` (files and directories), root
    /// exclusive.
    pub async fn gather_entries_recursively(&self, root: &Entry) -> Result<Vec<Entry>, ResolveError> {
        let mut gathered = Vec::new();
        self.find_entries_recursively(root, |entry| gathered.push(entry.clone()))
            .await?;
        Ok(gathered)
    }

    /// Call `visit` for each direct child of `dir`.
    pub async fn list_children<F>(&self, dir: &Entry, mut visit: F) -> Result<(), ResolveError>
    where
        F: FnMut(&Entry),
    {
        for child in self.reader.read_children(dir).await? {
            visit(&child);
        }
        Ok(())
    }

    /// Aggregate byte size of `entries`: files contribute their size,
    /// directories contribute the sum of their descendant files.
    pub async fn total_bytes(&self, entries: &[Entry]) -> Result<u64, ResolveError> {
        let mut total = 0u64;
        for entry in entries {
            if entry.is_directory {
                let mut subtotal = 0u64;
                self.find_files_recursively(entry, |file| subtotal += file.size)
                    .await?;
                total += subtotal;
            } else {
                total += entry.size;
            }
        }
        Ok(total)
    }

    /// Pick a name for `desired_name` that no sibling in `dir` already uses.
    ///
    /// Siblings are read once; if the name is taken, the smallest free
    /// counter wins: "file.txt", then "file (1).txt", "file (2).txt", and so
    /// on. A counter already present in `desired_name` restarts from 1.
    pub async fn deduplicate_path(&self, dir: &Entry, desired_name: &str) -> Result<String, ResolveError> {
        let siblings: HashSet<String> = self
            .reader
            .read_children(dir)
            .await?
            .iter()
            .map(|e| e.name().to_string())
            .collect();

        if !siblings.contains(desired_name) {
            return Ok(desired_name.to_string());
        }

        let (stem, ext) = split_name(desired_name);
        let mut counter = 1u64;
        loop {
            let candidate = format!("{stem} ({counter}){ext}");
            if !siblings.contains(&candidate) {
                return Ok(candidate);
            }
            counter += 1;
        }
    }
}
