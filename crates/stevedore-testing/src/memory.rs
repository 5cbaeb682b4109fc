//! In-memory multi-volume storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use stevedore_core::{
    BackendError, CopyEvent, Entry, EntryReader, EntryUrl, MountError, ResolveError,
    StorageBackend, VolumeHandle, VolumeId,
};

/// Entry URLs produced by the backend look like `mem://volume/path/to/file`.
pub(crate) fn parse_url(url: &EntryUrl) -> Option<(VolumeId, String)> {
    let rest = url.as_str().strip_prefix("mem://")?;
    match rest.split_once('/') {
        Some((volume, path)) => Some((VolumeId::new(volume), path.trim_end_matches('/').to_string())),
        None => Some((VolumeId::new(rest), String::new())),
    }
}

fn url_for(volume: &VolumeId, path: &str) -> EntryUrl {
    if path.is_empty() {
        EntryUrl::new(format!("mem://{volume}"))
    } else {
        EntryUrl::new(format!("mem://{volume}/{path}"))
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    is_directory: bool,
    size: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    volumes: HashMap<VolumeId, BTreeMap<String, Node>>,
}

impl MemoryState {
    fn node(&self, volume: &VolumeId, path: &str) -> Option<Node> {
        if path.is_empty() {
            // The volume root is an implicit directory.
            return self.volumes.contains_key(volume).then_some(Node {
                is_directory: true,
                size: 0,
            });
        }
        self.volumes.get(volume)?.get(path).copied()
    }

    fn entry(&self, volume: &VolumeId, path: &str) -> Option<Entry> {
        self.node(volume, path).map(|node| Entry {
            url: url_for(volume, path),
            is_directory: node.is_directory,
            size: node.size,
        })
    }

    /// Paths of `path` and everything beneath it, in tree order.
    fn subtree(&self, volume: &VolumeId, path: &str) -> Vec<String> {
        let Some(tree) = self.volumes.get(volume) else {
            return Vec::new();
        };
        let prefix = format!("{path}/");
        tree.keys()
            .filter(|k| k.as_str() == path || (!path.is_empty() && k.starts_with(&prefix)))
            .cloned()
            .collect()
    }

    /// Sum of file sizes at and beneath `path`.
    fn subtree_size(&self, volume: &VolumeId, path: &str) -> u64 {
        let Some(tree) = self.volumes.get(volume) else {
            return 0;
        };
        if path.is_empty() {
            return tree.values().filter(|n| !n.is_directory).map(|n| n.size).sum();
        }
        let prefix = format!("{path}/");
        tree.iter()
            .filter(|(k, _)| k.as_str() == path || k.starts_with(&prefix))
            .filter(|(_, n)| !n.is_directory)
            .map(|(_, n)| n.size)
            .sum()
    }
}

#[derive(Debug, Clone)]
struct MountScript {
    password: Option<String>,
    volume: VolumeId,
}

struct GateInner {
    url_prefix: String,
    notify: Arc<Notify>,
    blocked: Arc<AtomicUsize>,
}

/// Handle to a copy gate installed via [`MemoryBackend::block_destination`].
#[derive(Clone)]
pub struct CopyGate {
    notify: Arc<Notify>,
    blocked: Arc<AtomicUsize>,
}

impl CopyGate {
    /// Let one blocked copy proceed. Safe to call before the copy reaches
    /// the gate; the permit is stored.
    pub fn release(&self) {
        self.notify.notify_one();
    }

    /// Number of copies currently parked at the gate.
    pub fn blocked_count(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Wait until at least one copy is parked at the gate.
    pub async fn wait_blocked(&self) {
        while self.blocked_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

struct BackendInner {
    state: Mutex<MemoryState>,
    gate: Mutex<Option<GateInner>>,
    fail_copies: AtomicBool,
    mounts: Mutex<HashMap<String, MountScript>>,
    mount_attempts: Mutex<Vec<(String, Option<String>)>>,
}

/// In-memory [`StorageBackend`] + [`EntryReader`] over named volumes.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend with no volumes.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                state: Mutex::new(MemoryState::default()),
                gate: Mutex::new(None),
                fail_copies: AtomicBool::new(false),
                mounts: Mutex::new(HashMap::new()),
                mount_attempts: Mutex::new(Vec::new()),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.state.lock().expect("memory backend state poisoned")
    }

    /// Register a volume and return its root directory entry.
    pub fn add_volume(&self, volume: impl Into<VolumeId>) -> Entry {
        let volume = volume.into();
        self.state().volumes.entry(volume.clone()).or_default();
        Entry::directory(url_for(&volume, ""))
    }

    /// Create a directory at `path` (parents are not materialized).
    pub fn add_directory(&self, volume: impl Into<VolumeId>, path: &str) -> Entry {
        let volume = volume.into();
        let mut state = self.state();
        state.volumes.entry(volume.clone()).or_default().insert(
            path.to_string(),
            Node {
                is_directory: true,
                size: 0,
            },
        );
        Entry::directory(url_for(&volume, path))
    }

    /// Create a file of `size` bytes at `path`.
    pub fn add_file(&self, volume: impl Into<VolumeId>, path: &str, size: u64) -> Entry {
        let volume = volume.into();
        let mut state = self.state();
        state.volumes.entry(volume.clone()).or_default().insert(
            path.to_string(),
            Node {
                is_directory: false,
                size,
            },
        );
        Entry::file(url_for(&volume, path), size)
    }

    /// Look up the current entry at `path`, if any.
    pub fn entry(&self, volume: impl Into<VolumeId>, path: &str) -> Option<Entry> {
        let volume = volume.into();
        self.state().entry(&volume, path)
    }

    /// Whether an entry currently exists at `path`.
    pub fn exists(&self, volume: impl Into<VolumeId>, path: &str) -> bool {
        let volume = volume.into();
        self.state().node(&volume, path).is_some()
    }

    /// Block every copy whose destination URL starts with `url_prefix`
    /// until the returned gate releases it.
    pub fn block_destination(&self, url_prefix: &str) -> CopyGate {
        let notify = Arc::new(Notify::new());
        let blocked = Arc::new(AtomicUsize::new(0));
        *self.inner.gate.lock().expect("gate poisoned") = Some(GateInner {
            url_prefix: url_prefix.to_string(),
            notify: notify.clone(),
            blocked: blocked.clone(),
        });
        CopyGate { notify, blocked }
    }

    /// Make every subsequent copy fail with a backend error.
    pub fn fail_all_copies(&self, fail: bool) {
        self.inner.fail_copies.store(fail, Ordering::SeqCst);
    }

    /// Script the outcome of mounting `archive_url`: succeed as `volume`,
    /// demanding `password` first when one is given.
    pub fn script_mount(
        &self,
        archive_url: &str,
        password: Option<&str>,
        volume: impl Into<VolumeId>,
    ) {
        self.inner.mounts.lock().expect("mounts poisoned").insert(
            archive_url.to_string(),
            MountScript {
                password: password.map(str::to_string),
                volume: volume.into(),
            },
        );
    }

    /// Every `mount_archive` call observed so far, as (url, password) pairs.
    pub fn mount_attempts(&self) -> Vec<(String, Option<String>)> {
        self.inner
            .mount_attempts
            .lock()
            .expect("mount attempts poisoned")
            .clone()
    }

    fn gate_for(&self, dest_url: &EntryUrl) -> Option<(Arc<Notify>, Arc<AtomicUsize>)> {
        let gate = self.inner.gate.lock().expect("gate poisoned");
        gate.as_ref()
            .filter(|g| dest_url.as_str().starts_with(&g.url_prefix))
            .map(|g| (g.notify.clone(), g.blocked.clone()))
    }
}

#[async_trait]
impl EntryReader for MemoryBackend {
    async fn child(&self, dir: &Entry, name: &str) -> Result<Entry, ResolveError> {
        let (volume, path) = parse_url(&dir.url).ok_or_else(|| ResolveError::Storage {
            url: dir.url.clone(),
            message: "malformed url".to_string(),
        })?;
        let child_path = join(&path, name);
        let state = self.state();
        state
            .entry(&volume, &child_path)
            .ok_or_else(|| ResolveError::NotFound {
                url: url_for(&volume, &child_path),
            })
    }

    async fn read_children(&self, dir: &Entry) -> Result<Vec<Entry>, ResolveError> {
        let (volume, path) = parse_url(&dir.url).ok_or_else(|| ResolveError::Storage {
            url: dir.url.clone(),
            message: "malformed url".to_string(),
        })?;
        let state = self.state();
        let Some(tree) = state.volumes.get(&volume) else {
            return Err(ResolveError::NotFound { url: dir.url.clone() });
        };
        if !path.is_empty() && !tree.contains_key(&path) {
            return Err(ResolveError::NotFound { url: dir.url.clone() });
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        let children = tree
            .iter()
            .filter(|(k, _)| {
                k.starts_with(&prefix)
                    && k.len() > prefix.len()
                    && !k[prefix.len()..].contains('/')
            })
            .map(|(k, node)| Entry {
                url: url_for(&volume, k),
                is_directory: node.is_directory,
                size: node.size,
            })
            .collect();
        Ok(children)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn start_copy_or_move(
        &self,
        source: &Entry,
        target_dir: &Entry,
        new_name: &str,
        is_move: bool,
    ) -> mpsc::Receiver<CopyEvent> {
        let (tx, rx) = mpsc::channel(16);
        let backend = self.clone();
        let source = source.clone();
        let target_dir = target_dir.clone();
        let new_name = new_name.to_string();

        tokio::spawn(async move {
            let source_url = source.url.clone();
            let _ = tx
                .send(CopyEvent::Begin {
                    source: source_url.clone(),
                })
                .await;

            let Some((dst_volume, dst_path)) = parse_url(&target_dir.url) else {
                let _ = tx
                    .send(CopyEvent::Error {
                        error: BackendError::Other {
                            message: format!("malformed destination url: {}", target_dir.url),
                        },
                    })
                    .await;
                return;
            };
            let dest_path = join(&dst_path, &new_name);
            let dest_url = url_for(&dst_volume, &dest_path);

            if let Some((notify, blocked)) = backend.gate_for(&dest_url) {
                blocked.fetch_add(1, Ordering::SeqCst);
                notify.notified().await;
                blocked.fetch_sub(1, Ordering::SeqCst);
            }

            if backend.inner.fail_copies.load(Ordering::SeqCst) {
                let _ = tx
                    .send(CopyEvent::Error {
                        error: BackendError::Other {
                            message: "copy failed".to_string(),
                        },
                    })
                    .await;
                return;
            }

            let Some((src_volume, src_path)) = parse_url(&source_url) else {
                let _ = tx
                    .send(CopyEvent::Error {
                        error: BackendError::Other {
                            message: format!("malformed source url: {source_url}"),
                        },
                    })
                    .await;
                return;
            };

            let size = {
                let (exists, dst_ok, sz) = {
                    let state = backend.state();
                    let exists = state.node(&src_volume, &src_path).is_some();
                    let dst_ok = state.volumes.contains_key(&dst_volume);
                    let sz = if exists && dst_ok {
                        state.subtree_size(&src_volume, &src_path)
                    } else {
                        0
                    };
                    (exists, dst_ok, sz)
                };
                if !exists {
                    let _ = tx
                        .send(CopyEvent::Error {
                            error: BackendError::NotFound {
                                url: source_url.clone(),
                            },
                        })
                        .await;
                    return;
                }
                if !dst_ok {
                    let _ = tx
                        .send(CopyEvent::Error {
                            error: BackendError::VolumeUnavailable { volume: dst_volume },
                        })
                        .await;
                    return;
                }
                sz
            };

            if size > 1 {
                let _ = tx
                    .send(CopyEvent::Progress {
                        source: source_url.clone(),
                        processed: size / 2,
                    })
                    .await;
            }
            let _ = tx
                .send(CopyEvent::Progress {
                    source: source_url.clone(),
                    processed: size,
                })
                .await;

            let dest_entry = {
                let mut state = backend.state();
                let src_node = state
                    .node(&src_volume, &src_path)
                    .unwrap_or(Node {
                        is_directory: false,
                        size: 0,
                    });

                // Materialize the subtree under its new name.
                let paths = state.subtree(&src_volume, &src_path);
                let mut copied: Vec<(String, Node)> = Vec::new();
                if src_path.is_empty() {
                    copied.push((dest_path.clone(), src_node));
                } else {
                    for path in &paths {
                        let suffix = &path[src_path.len()..];
                        let node = state.node(&src_volume, path).unwrap_or(src_node);
                        copied.push((format!("{dest_path}{suffix}"), node));
                    }
                }
                let dst_tree = state.volumes.entry(dst_volume.clone()).or_default();
                for (path, node) in copied {
                    dst_tree.insert(path, node);
                }

                if is_move {
                    if let Some(src_tree) = state.volumes.get_mut(&src_volume) {
                        for path in &paths {
                            src_tree.remove(path);
                        }
                    }
                }

                Entry {
                    url: dest_url,
                    is_directory: src_node.is_directory,
                    size: src_node.size,
                }
            };

            let _ = tx
                .send(CopyEvent::EntryCopied {
                    source: source_url,
                    entry: dest_entry.clone(),
                })
                .await;
            let _ = tx.send(CopyEvent::Success { entry: dest_entry }).await;
        });

        rx
    }

    async fn zip_selection(
        &self,
        sources: &[Entry],
        target_dir: &Entry,
        new_name: &str,
    ) -> Result<Entry, BackendError> {
        let (dst_volume, dst_path) =
            parse_url(&target_dir.url).ok_or_else(|| BackendError::Other {
                message: format!("malformed destination url: {}", target_dir.url),
            })?;

        let mut state = self.state();
        if !state.volumes.contains_key(&dst_volume) {
            return Err(BackendError::VolumeUnavailable { volume: dst_volume });
        }

        let mut archive_size = 0u64;
        for source in sources {
            let (volume, path) = parse_url(&source.url).ok_or_else(|| BackendError::Other {
                message: format!("malformed source url: {}", source.url),
            })?;
            if state.node(&volume, &path).is_none() {
                return Err(BackendError::NotFound {
                    url: source.url.clone(),
                });
            }
            archive_size += state.subtree_size(&volume, &path);
        }

        let archive_path = join(&dst_path, new_name);
        state.volumes.entry(dst_volume.clone()).or_default().insert(
            archive_path.clone(),
            Node {
                is_directory: false,
                size: archive_size,
            },
        );
        Ok(Entry::file(url_for(&dst_volume, &archive_path), archive_size))
    }

    async fn delete_entry(&self, entry: &Entry) -> Result<(), BackendError> {
        let (volume, path) = parse_url(&entry.url).ok_or_else(|| BackendError::Other {
            message: format!("malformed url: {}", entry.url),
        })?;
        let mut state = self.state();
        if state.node(&volume, &path).is_none() {
            return Err(BackendError::NotFound {
                url: entry.url.clone(),
            });
        }
        let paths = state.subtree(&volume, &path);
        if let Some(tree) = state.volumes.get_mut(&volume) {
            for path in &paths {
                tree.remove(path);
            }
        }
        Ok(())
    }

    async fn mount_archive(
        &self,
        archive_url: &EntryUrl,
        password: Option<&str>,
    ) -> Result<VolumeHandle, MountError> {
        self.inner
            .mount_attempts
            .lock()
            .expect("mount attempts poisoned")
            .push((archive_url.to_string(), password.map(str::to_string)));

        let script = {
            let mounts = self.inner.mounts.lock().expect("mounts poisoned");
            mounts.get(archive_url.as_str()).cloned()
        };
        let Some(script) = script else {
            return Err(MountError::Internal {
                message: format!("no such archive: {archive_url}"),
            });
        };

        match (&script.password, password) {
            (None, _) => {}
            (Some(expected), Some(given)) if expected == given => {}
            _ => return Err(MountError::NeedPassword),
        }

        let root = self.add_volume(script.volume.clone());
        Ok(VolumeHandle {
            volume_id: script.volume,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<CopyEvent>) -> Vec<CopyEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_read_children_is_single_level() {
        let backend = MemoryBackend::new();
        let root = backend.add_volume("vol");
        backend.add_file("vol", "a.txt", 1);
        backend.add_directory("vol", "dir");
        backend.add_file("vol", "dir/nested.txt", 1);

        let children = backend.read_children(&root).await.unwrap();
        let mut names: Vec<&str> = children.iter().map(|e| e.name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a.txt", "dir"]);
    }

    #[tokio::test]
    async fn test_copy_streams_progress_then_success() {
        let backend = MemoryBackend::new();
        backend.add_volume("vol");
        let source = backend.add_file("vol", "a.txt", 10);
        let dest = backend.add_directory("vol", "dest");

        let events = drain(backend.start_copy_or_move(&source, &dest, "a.txt", false)).await;
        assert!(matches!(events.first(), Some(CopyEvent::Begin { .. })));
        assert!(matches!(events.last(), Some(CopyEvent::Success { .. })));
        assert!(backend.exists("vol", "dest/a.txt"));
        assert!(backend.exists("vol", "a.txt"));
    }

    #[tokio::test]
    async fn test_move_takes_the_subtree_along() {
        let backend = MemoryBackend::new();
        backend.add_volume("vol");
        let dir = backend.add_directory("vol", "album");
        backend.add_file("vol", "album/a.jpg", 5);
        let dest = backend.add_directory("vol", "dest");

        drain(backend.start_copy_or_move(&dir, &dest, "album", true)).await;
        assert!(!backend.exists("vol", "album"));
        assert!(!backend.exists("vol", "album/a.jpg"));
        assert!(backend.exists("vol", "dest/album"));
        assert!(backend.exists("vol", "dest/album/a.jpg"));
    }

    #[tokio::test]
    async fn test_scripted_mount_checks_the_password() {
        let backend = MemoryBackend::new();
        let url = EntryUrl::new("mem://vol/secret.zip");
        backend.script_mount(url.as_str(), Some("pw"), "archive");

        assert_eq!(
            backend.mount_archive(&url, None).await.unwrap_err(),
            MountError::NeedPassword
        );
        let handle = backend.mount_archive(&url, Some("pw")).await.unwrap();
        assert_eq!(handle.volume_id, VolumeId::new("archive"));
        assert_eq!(backend.mount_attempts().len(), 2);
    }
}
