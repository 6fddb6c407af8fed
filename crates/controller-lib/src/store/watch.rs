//! Pending one-shot watch registrations
//!
//! Shared by the store implementations. Each fire drains the registrations
//! of that path so a watch is delivered at most once.

use super::{Watch, WatchEvent, WatchEventKind};
use std::collections::HashMap;
use tokio::sync::oneshot;

type Pending = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

/// Registry of pending watches keyed by path
#[derive(Debug, Default)]
pub struct WatchRegistry {
    exists: Pending,
    data: Pending,
    children: Pending,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existence watch
    pub fn watch_exists(&mut self, path: &str) -> Watch {
        Self::register(&mut self.exists, path)
    }

    /// Register a data watch
    pub fn watch_data(&mut self, path: &str) -> Watch {
        Self::register(&mut self.data, path)
    }

    /// Register a children watch
    pub fn watch_children(&mut self, path: &str) -> Watch {
        Self::register(&mut self.children, path)
    }

    fn register(pending: &mut Pending, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        pending.entry(path.to_string()).or_default().push(tx);
        Watch::new(path, rx)
    }

    /// A node was created at `path`
    pub fn node_created(&mut self, path: &str) {
        Self::fire(&mut self.exists, path, WatchEventKind::Created);
        if let Some(parent) = super::parent_path(path) {
            Self::fire(&mut self.children, parent, WatchEventKind::ChildrenChanged);
        }
    }

    /// The payload of `path` changed
    pub fn data_changed(&mut self, path: &str) {
        Self::fire(&mut self.exists, path, WatchEventKind::DataChanged);
        Self::fire(&mut self.data, path, WatchEventKind::DataChanged);
    }

    /// The node at `path` was deleted
    pub fn node_deleted(&mut self, path: &str) {
        Self::fire(&mut self.exists, path, WatchEventKind::Deleted);
        Self::fire(&mut self.data, path, WatchEventKind::Deleted);
        Self::fire(&mut self.children, path, WatchEventKind::Deleted);
        if let Some(parent) = super::parent_path(path) {
            Self::fire(&mut self.children, parent, WatchEventKind::ChildrenChanged);
        }
    }

    /// Drop every pending registration; receivers observe `SessionLost`
    pub fn clear(&mut self) {
        self.exists.clear();
        self.data.clear();
        self.children.clear();
    }

    /// Drop registrations whose receiver is gone
    pub fn prune(&mut self) {
        for pending in [&mut self.exists, &mut self.data, &mut self.children] {
            pending.retain(|_, senders| {
                senders.retain(|tx| !tx.is_closed());
                !senders.is_empty()
            });
        }
    }

    /// Number of registrations still waiting for an event
    pub fn pending(&self) -> usize {
        self.exists.values().map(Vec::len).sum::<usize>()
            + self.data.values().map(Vec::len).sum::<usize>()
            + self.children.values().map(Vec::len).sum::<usize>()
    }

    fn fire(pending: &mut Pending, path: &str, kind: WatchEventKind) {
        if let Some(senders) = pending.remove(path) {
            for tx in senders {
                // Receiver may already be gone (watcher task stopped)
                let _ = tx.send(WatchEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }
}
