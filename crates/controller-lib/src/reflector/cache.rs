//! Keyed cache of exported services
//!
//! Written concurrently by per-node watcher tasks and the resync loop, read
//! by the reconciliation pass. Every mutation invokes the registered
//! [`EventHandler`], which must not block.

use crate::models::ExportedService;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Receiver of cache change notifications
pub trait EventHandler: Send + Sync {
    fn on_add(&self, service: &ExportedService);
    fn on_update(&self, old: &ExportedService, new: &ExportedService);
    fn on_delete(&self, service: &ExportedService);
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn on_add(&self, _service: &ExportedService) {}
    fn on_update(&self, _old: &ExportedService, _new: &ExportedService) {}
    fn on_delete(&self, _service: &ExportedService) {}
}

/// Thread-safe map of store node name -> service record
pub struct ServiceCache {
    services: DashMap<String, ExportedService>,
    handler: Arc<dyn EventHandler>,
}

impl ServiceCache {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            services: DashMap::new(),
            handler,
        }
    }

    /// Insert or replace a record; returns true when the key was new
    pub fn upsert(&self, key: &str, service: ExportedService) -> bool {
        // Release the shard lock before calling out to the handler
        let previous = self.services.insert(key.to_string(), service.clone());
        match previous {
            None => {
                debug!(service = %key, "Service added");
                self.handler.on_add(&service);
                true
            }
            Some(old) => {
                debug!(service = %key, "Service updated");
                self.handler.on_update(&old, &service);
                false
            }
        }
    }

    /// Remove a record, notifying the handler if it existed
    pub fn delete(&self, key: &str) -> Option<ExportedService> {
        let removed = self.services.remove(key).map(|(_, v)| v);
        if let Some(service) = &removed {
            debug!(service = %key, "Service deleted");
            self.handler.on_delete(service);
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<ExportedService> {
        self.services.get(key).map(|r| r.value().clone())
    }

    /// Cached keys (store node names)
    pub fn keys(&self) -> Vec<String> {
        self.services.iter().map(|r| r.key().clone()).collect()
    }

    /// Copy of every cached record
    pub fn list(&self) -> Vec<ExportedService> {
        self.services.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
