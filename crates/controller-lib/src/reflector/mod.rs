//! Service reflector
//!
//! Mirrors the exported-service nodes of the coordination store into a local
//! [`ServiceCache`]:
//! - waits (via an existence watch) for the root watch path to appear
//! - keeps a children watch on the root and spawns one watcher task per node
//! - each node watcher re-arms its one-shot data watch in a loop
//! - an independent full resync deletes entries missed by watches and
//!   refreshes every live node
//!
//! Store and decode failures are logged and retried after a fixed delay;
//! nothing here is fatal to the process. Root watch and resync failures mark
//! the `reflector` health component degraded until the next good listing.

mod cache;


pub use cache::{EventHandler, NoopHandler, ServiceCache};

use crate::error::StoreError;
use crate::health::{components, HealthRegistry};
use crate::models::decode_service;
use crate::observability::ControllerMetrics;
use crate::service::ServiceSnapshot;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::store::{join_path, CoordinationStore, WatchEventKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the reflector
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Store path whose children are the exported services
    pub watch_path: String,
    /// Instance group; services not tagged with it are not listed
    pub group: String,
    /// Period of the full resync
    pub sync_period: Duration,
    /// Fixed delay before retrying a failed store operation
    pub retry_delay: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            watch_path: "/loadbalance/export".to_string(),
            group: "external".to_string(),
            sync_period: Duration::from_secs(60),
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Source of the normalized service view
pub trait ServiceLister: Send + Sync {
    fn list(&self) -> ServiceSnapshot;
}

/// Lister over the reflector cache, filtered by instance group
#[derive(Clone)]
pub struct CacheLister {
    cache: Arc<ServiceCache>,
    group: String,
}

impl CacheLister {
    pub fn new(cache: Arc<ServiceCache>, group: impl Into<String>) -> Self {
        Self {
            cache,
            group: group.into(),
        }
    }
}

impl ServiceLister for CacheLister {
    fn list(&self) -> ServiceSnapshot {
        let services = self.cache.list();
        ServiceSnapshot::from_services(&services, &self.group)
    }
}

struct NodeWatcher {
    id: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    config: ReflectorConfig,
    cache: Arc<ServiceCache>,
    watchers: DashMap<String, NodeWatcher>,
    next_watcher_id: AtomicU64,
    shutdown: Shutdown,
    health: HealthRegistry,
    metrics: ControllerMetrics,
}

/// Keeps the service cache synchronized with the coordination store
pub struct Reflector {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reflector {
    /// Create a reflector; `shutdown` is the exit signal for all its tasks
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: ReflectorConfig,
        handler: Arc<dyn EventHandler>,
        shutdown: Shutdown,
        health: HealthRegistry,
    ) -> Self {
        let inner = Inner {
            store,
            config,
            cache: Arc::new(ServiceCache::new(handler)),
            watchers: DashMap::new(),
            next_watcher_id: AtomicU64::new(0),
            shutdown,
            health,
            metrics: ControllerMetrics::new(),
        };
        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Establish the watch tree and start the resync loop
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            warn!("Reflector already started");
            return;
        }

        info!(
            watch_path = %self.inner.config.watch_path,
            group = %self.inner.config.group,
            sync_period_secs = self.inner.config.sync_period.as_secs(),
            "Starting service reflector"
        );

        tasks.push(tokio::spawn(self.inner.clone().run_root()));
        tasks.push(tokio::spawn(self.inner.clone().run_resync()));
    }

    /// Tear down every watch and wait for the tasks to finish
    pub async fn stop(&self) {
        self.inner.shutdown.trigger();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            let _ = task.await;
        }

        let keys: Vec<String> = self.inner.watchers.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            if let Some((_, watcher)) = self.inner.watchers.remove(&key) {
                let _ = watcher.handle.await;
            }
        }
        info!("Service reflector stopped");
    }

    /// Snapshot lister over the cache
    pub fn lister(&self) -> CacheLister {
        CacheLister::new(self.inner.cache.clone(), self.inner.config.group.clone())
    }

    pub fn cache(&self) -> Arc<ServiceCache> {
        self.inner.cache.clone()
    }

    /// Run one full resync immediately
    pub async fn resync(&self) -> Result<(), StoreError> {
        self.inner.resync().await
    }

    /// Number of live per-node watcher tasks
    pub fn watcher_count(&self) -> usize {
        self.inner
            .watchers
            .iter()
            .filter(|r| !r.value().handle.is_finished())
            .count()
    }
}

impl Inner {
    fn node_path(&self, key: &str) -> String {
        join_path(&self.config.watch_path, key)
    }

    /// Sleep for the retry delay; false if shutdown arrived first
    async fn pause(&self, shutdown: &mut ShutdownSignal) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_delay) => true,
            _ = shutdown.recv() => false,
        }
    }

    async fn run_root(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        while !shutdown.is_triggered() {
            if let Err(e) = self.watch_root(&mut shutdown).await {
                warn!(
                    path = %self.config.watch_path,
                    error = %e,
                    "Root watch failed, retrying"
                );
                self.metrics.inc_watch_event("store_error");
                self.health
                    .set_degraded(components::REFLECTOR, format!("root watch failed: {e}"))
                    .await;
                if !self.pause(&mut shutdown).await {
                    break;
                }
            }
        }
        debug!("Root watcher exited");
    }

    /// One pass of the root state machine: wait for existence, then follow
    /// children until the root goes away or the session is lost
    async fn watch_root(self: &Arc<Self>, shutdown: &mut ShutdownSignal) -> Result<(), StoreError> {
        let root = self.config.watch_path.clone();

        let (exists, exists_watch) = self.store.exists_w(&root).await?;
        if !exists {
            info!(path = %root, "Watch path absent, waiting for creation");
            tokio::select! {
                _ = shutdown.recv() => {}
                event = exists_watch.recv() => {
                    debug!(path = %root, kind = ?event.kind, "Watch path existence event");
                }
            }
            return Ok(());
        }
        drop(exists_watch);

        loop {
            let (children, watch) = match self.store.children_w(&root).await {
                Ok(result) => result,
                Err(StoreError::NoNode(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            self.metrics.inc_watch_event("children_listed");
            self.health.set_healthy(components::REFLECTOR).await;
            self.ensure_watchers(&children);

            let event = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                event = watch.recv() => event,
            };

            match event.kind {
                WatchEventKind::Deleted => {
                    warn!(path = %root, "Watch path deleted");
                    return Ok(());
                }
                WatchEventKind::SessionLost => {
                    warn!(path = %root, "Children watch lost, re-arming");
                    self.metrics.inc_watch_event("session_lost");
                }
                _ => {}
            }
        }
    }

    /// Spawn a watcher for every child without a live one
    fn ensure_watchers(self: &Arc<Self>, children: &[String]) {
        for key in children {
            // The entry stays locked between the liveness check and the insert
            match self.watchers.entry(key.clone()) {
                Entry::Occupied(entry) if !entry.get().handle.is_finished() => continue,
                entry => {
                    let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
                    let handle = tokio::spawn(self.clone().watch_node(key.clone(), id));
                    debug!(service = %key, "Spawned node watcher");
                    entry.insert(NodeWatcher { id, handle });
                }
            }
        }
    }

    /// Follow one node until it is gone
    ///
    /// A `Deleted` event only leads to a re-read: the node may already be
    /// back. The watcher exits once a read finds no node.
    async fn watch_node(self: Arc<Self>, key: String, id: u64) {
        let path = self.node_path(&key);
        let mut shutdown = self.shutdown.subscribe();
        let mut gone = false;

        while !shutdown.is_triggered() {
            let result = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.store.get_w(&path) => result,
            };

            match result {
                Ok((data, watch)) => {
                    self.apply_payload(&key, &data);

                    let event = tokio::select! {
                        _ = shutdown.recv() => break,
                        event = watch.recv() => event,
                    };
                    match event.kind {
                        WatchEventKind::Deleted => {
                            debug!(service = %key, "Node deleted, re-reading");
                        }
                        WatchEventKind::SessionLost => {
                            debug!(service = %key, "Node watch lost, re-arming");
                            self.metrics.inc_watch_event("session_lost");
                        }
                        _ => {}
                    }
                }
                Err(StoreError::NoNode(_)) => {
                    gone = true;
                    break;
                }
                Err(e) => {
                    warn!(service = %key, error = %e, "Failed to read service node, retrying");
                    self.metrics.inc_watch_event("store_error");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if !gone {
            self.watchers.remove_if(&key, |_, w| w.id == id);
            debug!(service = %key, "Node watcher exited");
            return;
        }

        // Cache first, registration second: any watcher spawned after the
        // deregistration writes after this delete
        self.remove(&key, "watch");
        self.watchers.remove_if(&key, |_, w| w.id == id);
        debug!(service = %key, "Node watcher exited, node gone");

        // The root may have listed a re-created node while this watcher was
        // still registered and skipped it
        match self.store.exists(&path).await {
            Ok(true) if !shutdown.is_triggered() => {
                debug!(service = %key, "Node re-created, handing over to a new watcher");
                self.ensure_watchers(std::slice::from_ref(&key));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(service = %key, error = %e, "Existence check failed, left to resync");
                self.metrics.inc_watch_event("store_error");
            }
        }
    }

    /// Decode a payload into the cache; bad payloads keep the previous entry
    fn apply_payload(&self, key: &str, data: &[u8]) {
        match decode_service(data) {
            Ok(service) => {
                if self.cache.upsert(key, service) {
                    self.metrics.inc_watch_event("add");
                } else {
                    self.metrics.inc_watch_event("update");
                }
            }
            Err(e) => {
                warn!(service = %key, error = %e, "Failed to decode service payload, skipping");
                self.metrics.inc_watch_event("decode_error");
            }
        }
    }

    fn remove(&self, key: &str, source: &str) {
        if self.cache.delete(key).is_some() {
            info!(service = %key, source = %source, "Service removed");
            let event = if source == "resync" { "resync_delete" } else { "delete" };
            self.metrics.inc_watch_event(event);
        }
    }

    async fn run_resync(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.sync_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Full resync failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Resync loop exited");
                    break;
                }
            }
        }
    }

    async fn resync(self: &Arc<Self>) -> Result<(), StoreError> {
        let root = &self.config.watch_path;
        let children = match self.store.children(root).await {
            Ok(children) => children,
            Err(StoreError::NoNode(_)) => Vec::new(),
            Err(e) => {
                self.metrics.inc_watch_event("store_error");
                self.health
                    .set_degraded(components::REFLECTOR, format!("resync failed: {e}"))
                    .await;
                return Err(e);
            }
        };
        self.health.set_healthy(components::REFLECTOR).await;

        let live: HashSet<&str> = children.iter().map(String::as_str).collect();
        for key in self.cache.keys() {
            if !live.contains(key.as_str()) {
                self.remove(&key, "resync");
            }
        }

        for key in &children {
            match self.store.get(&self.node_path(key)).await {
                Ok(data) => self.apply_payload(key, &data),
                Err(StoreError::NoNode(_)) => self.remove(key, "resync"),
                Err(e) => {
                    warn!(service = %key, error = %e, "Resync read failed");
                    self.metrics.inc_watch_event("store_error");
                }
            }
        }

        self.ensure_watchers(&children);
        debug!(services = children.len(), "Full resync complete");
        Ok(())
    }
}
