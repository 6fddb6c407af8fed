//! Directory-backed coordination store
//!
//! Maps store paths onto a directory tree under a base directory: every
//! service node is a file, every intermediate node a directory. Filesystem
//! notifications are translated into one-shot watch deliveries. Dot-files
//! (editor swap files, temp files of atomic writers) are invisible.

use super::{CoordinationStore, Watch, WatchRegistry};
use crate::error::StoreError;
use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A filesystem change expressed in store paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FsChange {
    Created(String),
    Changed(String),
    Deleted(String),
}

/// Store backed by a local directory tree
pub struct FsStore {
    base: PathBuf,
    registry: Arc<Mutex<WatchRegistry>>,
    _watcher: Mutex<RecommendedWatcher>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `base`
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|source| StoreError::Io {
            path: base.clone(),
            source,
        })?;

        let registry = Arc::new(Mutex::new(WatchRegistry::new()));
        let handler_registry = registry.clone();
        let handler_base = base.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let changes = translate_event(&handler_base, &event);
                    if changes.is_empty() {
                        return;
                    }
                    let mut registry = lock_registry(&handler_registry);
                    for change in changes {
                        debug!(change = ?change, "Store change detected");
                        match change {
                            FsChange::Created(path) => registry.node_created(&path),
                            FsChange::Changed(path) => registry.data_changed(&path),
                            FsChange::Deleted(path) => registry.node_deleted(&path),
                        }
                    }
                }
                Err(e) => {
                    // Events may have been lost; force every watcher to re-read
                    warn!(error = %e, "Filesystem watch error, dropping pending watches");
                    lock_registry(&handler_registry).clear();
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        watcher
            .watch(&base, RecursiveMode::Recursive)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(base = %base.display(), "Filesystem store opened");

        Ok(Self {
            base,
            registry,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Base directory of the store
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn fs_path(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, WatchRegistry> {
        lock_registry(&self.registry)
    }

    fn abandon(&self, watch: Watch, error: StoreError) -> StoreError {
        drop(watch);
        self.registry().prune();
        error
    }

    async fn read_node(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let fs_path = self.fs_path(path);
        match tokio::fs::metadata(&fs_path).await {
            Ok(meta) if meta.is_dir() => return Ok(Vec::new()),
            Ok(_) => {}
            Err(e) => return Err(io_error(path, &fs_path, e)),
        }
        tokio::fs::read(&fs_path)
            .await
            .map_err(|e| io_error(path, &fs_path, e))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let fs_path = self.fs_path(path);
        let mut entries = tokio::fs::read_dir(&fs_path)
            .await
            .map_err(|e| io_error(path, &fs_path, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(path, &fs_path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_hidden(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn node_exists(&self, path: &str) -> Result<bool, StoreError> {
        let fs_path = self.fs_path(path);
        tokio::fs::try_exists(&fs_path)
            .await
            .map_err(|source| StoreError::Io {
                path: fs_path,
                source,
            })
    }
}

#[async_trait]
impl CoordinationStore for FsStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.node_exists(path).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.read_node(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.list_children(path).await
    }

    // Watches are registered before reading so no change between the read
    // and the registration is lost; a spurious extra delivery is harmless.
    // A failed read abandons its registration.

    async fn exists_w(&self, path: &str) -> Result<(bool, Watch), StoreError> {
        let watch = self.registry().watch_exists(path);
        match self.node_exists(path).await {
            Ok(exists) => Ok((exists, watch)),
            Err(e) => Err(self.abandon(watch, e)),
        }
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch), StoreError> {
        let watch = self.registry().watch_data(path);
        match self.read_node(path).await {
            Ok(data) => Ok((data, watch)),
            Err(e) => Err(self.abandon(watch, e)),
        }
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError> {
        let watch = self.registry().watch_children(path);
        match self.list_children(path).await {
            Ok(children) => Ok((children, watch)),
            Err(e) => Err(self.abandon(watch, e)),
        }
    }
}

fn lock_registry(registry: &Mutex<WatchRegistry>) -> std::sync::MutexGuard<'_, WatchRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn io_error(path: &str, fs_path: &Path, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NoNode(path.to_string())
    } else {
        StoreError::Io {
            path: fs_path.to_path_buf(),
            source: e,
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Convert a filesystem path under `base` into a store path
pub(crate) fn store_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if is_hidden(&part) {
                    return None;
                }
                parts.push(part.to_string());
            }
            _ => return None,
        }
    }
    Some(format!("/{}", parts.join("/")))
}

/// Translate a notify event into store-level changes
pub(crate) fn translate_event(base: &Path, event: &Event) -> Vec<FsChange> {
    event
        .paths
        .iter()
        .filter_map(|path| {
            let store = store_path(base, path)?;
            match event.kind {
                EventKind::Create(_) => Some(FsChange::Created(store)),
                EventKind::Remove(_) => Some(FsChange::Deleted(store)),
                EventKind::Modify(ModifyKind::Name(_)) => {
                    // Renames report both ends; classify by what is there now
                    if path.exists() {
                        Some(FsChange::Created(store))
                    } else {
                        Some(FsChange::Deleted(store))
                    }
                }
                EventKind::Modify(ModifyKind::Metadata(_)) => None,
                EventKind::Modify(_) => Some(FsChange::Changed(store)),
                _ => None,
            }
        })
        .collect()
}
