//! In-memory coordination store
//!
//! A node tree with the same one-shot watch semantics as the remote store,
//! plus hooks for injecting faults:
//! - `remove_silently` deletes without delivering any watch
//! - `fail_next` makes the next N calls fail with a connection error
//! - `expire_session` drops every pending watch

use super::{parent_path, CoordinationStore, Watch, WatchRegistry};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Vec<u8>>,
    watches: WatchRegistry,
}

impl Tree {
    fn contains(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_path(path);
        while let Some(parent) = current {
            if self.contains(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_path(parent);
        }
        for parent in missing.into_iter().rev() {
            self.nodes.insert(parent.clone(), Vec::new());
            self.watches.node_created(&parent);
        }
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|candidate| parent_path(candidate) == Some(path))
            .filter_map(|candidate| candidate.rsplit('/').next().map(str::to_string))
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut paths: Vec<String> = self
            .nodes
            .keys()
            .filter(|candidate| candidate.as_str() == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();
        // Deepest first so children go before their parent
        paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        paths
    }
}

/// In-process store with ZooKeeper-like watch delivery
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        // A panic while holding the lock leaves the tree intact; keep serving
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or overwrite a node, creating missing parents
    pub fn set(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut tree = self.lock();
        tree.ensure_parents(path);
        let existed = tree.nodes.insert(path.to_string(), data.into()).is_some();
        if existed {
            tree.watches.data_changed(path);
        } else {
            tree.watches.node_created(path);
        }
    }

    /// Delete a node and its descendants, delivering watches
    pub fn delete(&self, path: &str) {
        let mut tree = self.lock();
        for node in tree.subtree(path) {
            tree.nodes.remove(&node);
            tree.watches.node_deleted(&node);
        }
    }

    /// Delete a node and its descendants without delivering any watch
    pub fn remove_silently(&self, path: &str) {
        let mut tree = self.lock();
        for node in tree.subtree(path) {
            tree.nodes.remove(&node);
        }
    }

    /// Make the next `count` store calls fail with a connection error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Drop every pending watch as a session expiry would
    pub fn expire_session(&self) {
        self.lock().watches.clear();
    }

    /// Number of registered watches not yet delivered
    pub fn pending_watches(&self) -> usize {
        self.lock().watches.pending()
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Connection("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.check_fault()?;
        Ok(self.lock().contains(path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.check_fault()?;
        self.lock()
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_fault()?;
        let tree = self.lock();
        if !tree.contains(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(tree.child_names(path))
    }

    async fn exists_w(&self, path: &str) -> Result<(bool, Watch), StoreError> {
        self.check_fault()?;
        let mut tree = self.lock();
        let exists = tree.contains(path);
        Ok((exists, tree.watches.watch_exists(path)))
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch), StoreError> {
        self.check_fault()?;
        let mut tree = self.lock();
        let data = tree
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        Ok((data, tree.watches.watch_data(path)))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError> {
        self.check_fault()?;
        let mut tree = self.lock();
        if !tree.contains(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = tree.child_names(path);
        Ok((children, tree.watches.watch_children(path)))
    }
}
