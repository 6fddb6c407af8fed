//! Coordination store client abstraction
//!
//! The reflector consumes a hierarchical store with one-shot watches:
//! every `*_w` call returns the current value plus a [`Watch`] that resolves
//! with exactly one future event for that path. Watches must be re-armed by
//! the caller after they fire.
//!
//! Implementations:
//! - [`MemoryStore`]: in-process tree, used by tests and embedders
//! - [`FsStore`]: a directory tree with watch delivery through `notify`

mod fs;
mod memory;
mod watch;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use watch::WatchRegistry;

use crate::error::StoreError;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Kind of change delivered by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// The store dropped the watch (connection/session loss)
    SessionLost,
}

/// A single event delivered to a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// A one-shot watch registration
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub(crate) fn new(path: impl Into<String>, rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    /// Path this watch was registered on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the event; a dropped registration reports `SessionLost`
    pub async fn recv(self) -> WatchEvent {
        match self.rx.await {
            Ok(event) => event,
            Err(_) => WatchEvent {
                kind: WatchEventKind::SessionLost,
                path: self.path,
            },
        }
    }
}

/// Client of a hierarchical coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Check whether a node exists
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Read a node's payload
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// List the names (not full paths) of a node's children
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Check existence and watch for creation, deletion or data change
    async fn exists_w(&self, path: &str) -> Result<(bool, Watch), StoreError>;

    /// Read a node's payload and watch for data change or deletion
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch), StoreError>;

    /// List children and watch for membership changes or deletion
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), StoreError>;
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a store path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/bcs/export", "ns.svc"), "/bcs/export/ns.svc");
        assert_eq!(join_path("/", "a"), "/a");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/bcs/export/ns.svc"), Some("/bcs/export"));
        assert_eq!(parent_path("/bcs"), Some("/"));
        assert_eq!(parent_path("/"), None);
    }

    #[tokio::test]
    async fn test_dropped_watch_reports_session_lost() {
        let (tx, rx) = oneshot::channel();
        let watch = Watch::new("/a", rx);
        drop(tx);
        let event = watch.recv().await;
        assert_eq!(event.kind, WatchEventKind::SessionLost);
        assert_eq!(event.path, "/a");
    }
}
