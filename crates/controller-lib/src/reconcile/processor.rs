//! Reconciliation loop
//!
//! Reflector callbacks only raise a dirty flag. A short check timer runs a
//! pass when the flag is set, a longer sync timer runs one unconditionally.
//! An `applying` flag makes overlapping passes impossible: a tick arriving
//! while a pass is running is skipped, not queued.

use super::conflict::detect_conflicts;
use crate::error::ConflictError;
use crate::health::{components, HealthRegistry};
use crate::models::ExportedService;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::proxy::ConfigManager;
use crate::reflector::{EventHandler, ServiceLister};
use crate::service::ServiceSnapshot;
use crate::shutdown::ShutdownSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the event processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How often the dirty flag is checked
    pub check_period: Duration,
    /// Period of the unconditional pass
    pub sync_period: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(3),
            sync_period: Duration::from_secs(30),
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do, or another pass was running
    Skipped,
    /// Two entries claim one address; the proxy was not touched
    Conflict(ConflictError),
    /// Reconciled over the runtime API (possibly with zero commands)
    Patched,
    /// The rendered file matches the active one
    Unchanged,
    /// The candidate was rejected by the proxy's checker
    ValidationFailed,
    Reloaded,
    /// Render, replace or reload failed
    Failed,
}

/// Dirty flag raised by reflector callbacks
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    dirty: AtomicBool,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set
    fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

impl EventHandler for ChangeNotifier {
    fn on_add(&self, _service: &ExportedService) {
        self.mark();
    }

    fn on_update(&self, old: &ExportedService, new: &ExportedService) {
        if old != new {
            self.mark();
        }
    }

    fn on_delete(&self, _service: &ExportedService) {
        self.mark();
    }
}

/// Clears `applying` when the pass ends, however it ends
struct ApplyGuard<'a>(&'a AtomicBool);

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct EventProcessor {
    config: ProcessorConfig,
    lister: Arc<dyn ServiceLister>,
    manager: Arc<dyn ConfigManager>,
    notifier: Arc<ChangeNotifier>,
    health: HealthRegistry,
    applying: AtomicBool,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl EventProcessor {
    pub fn new(
        config: ProcessorConfig,
        lister: Arc<dyn ServiceLister>,
        manager: Arc<dyn ConfigManager>,
        notifier: Arc<ChangeNotifier>,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(manager.kind().to_string());
        Self {
            config,
            lister,
            manager,
            notifier,
            health,
            applying: AtomicBool::new(false),
            metrics: ControllerMetrics::new(),
            logger,
        }
    }

    /// Drive the check and sync timers until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut check = interval(self.config.check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync = interval_at(
            tokio::time::Instant::now() + self.config.sync_period,
            self.config.sync_period,
        );
        sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            check_period_ms = self.config.check_period.as_millis() as u64,
            sync_period_secs = self.config.sync_period.as_secs(),
            proxy = %self.manager.kind(),
            "Event processor started"
        );
        self.health.set_healthy(components::EVENT_PROCESSOR).await;

        loop {
            tokio::select! {
                _ = check.tick() => {
                    self.reconcile_if_dirty().await;
                }
                _ = sync.tick() => {
                    debug!("Periodic full reconciliation");
                    self.reconcile().await;
                }
                _ = shutdown.recv() => {
                    info!("Event processor stopping");
                    break;
                }
            }
        }
    }

    /// Run a pass if something changed since the last one
    pub async fn reconcile_if_dirty(&self) -> ReconcileOutcome {
        if !self.notifier.is_dirty() {
            return ReconcileOutcome::Skipped;
        }
        let Some(_guard) = self.begin() else {
            debug!("Reconciliation already running, tick skipped");
            return ReconcileOutcome::Skipped;
        };
        self.notifier.take();
        self.pass().await
    }

    /// Run a pass unconditionally
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let Some(_guard) = self.begin() else {
            debug!("Reconciliation already running, tick skipped");
            return ReconcileOutcome::Skipped;
        };
        self.notifier.take();
        self.pass().await
    }

    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Option<ApplyGuard<'_>> {
        self.applying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ApplyGuard(&self.applying))
    }

    async fn pass(&self) -> ReconcileOutcome {
        let started = Instant::now();
        let snapshot = self.lister.list();
        self.metrics.set_services(&snapshot);

        let outcome = match detect_conflicts(&snapshot) {
            Err(conflict) => {
                self.metrics.inc_conflicts();
                self.logger
                    .log_conflict(&conflict.address, &conflict.first, &conflict.second);
                ReconcileOutcome::Conflict(conflict)
            }
            Ok(()) => self.apply(&snapshot).await,
        };

        self.metrics.observe_reconcile(started.elapsed().as_secs_f64());
        self.record_health(&outcome).await;
        debug!(outcome = ?outcome, entries = snapshot.len(), "Reconciliation pass finished");
        outcome
    }

    /// The apply protocol; every early return leaves the live config intact
    async fn apply(&self, snapshot: &ServiceSnapshot) -> ReconcileOutcome {
        if !self.manager.try_update_without_reload(snapshot).await {
            return ReconcileOutcome::Patched;
        }

        let candidate = match self.manager.create(snapshot).await {
            Ok(candidate) => {
                self.metrics.record_operation("create", true);
                candidate
            }
            Err(e) => {
                self.metrics.record_operation("create", false);
                warn!(error = %e, "Failed to render configuration");
                return ReconcileOutcome::Failed;
            }
        };

        match self.manager.check_difference(&candidate).await {
            Ok(false) if !self.manager.requires_full_apply() => {
                debug!(checksum = %candidate.checksum, "Configuration unchanged");
                return ReconcileOutcome::Unchanged;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not compare configuration, applying"),
        }

        if let Err(e) = self.manager.validate(&candidate).await {
            self.metrics.record_operation("validate", false);
            self.logger.log_validation_failed(&e.to_string());
            return ReconcileOutcome::ValidationFailed;
        }
        self.metrics.record_operation("validate", true);

        if let Err(e) = self.manager.replace(&candidate).await {
            self.metrics.record_operation("replace", false);
            warn!(error = %e, "Failed to replace active configuration");
            return ReconcileOutcome::Failed;
        }
        self.metrics.record_operation("replace", true);

        match self.manager.reload().await {
            Ok(()) => {
                self.metrics.record_operation("reload", true);
                self.logger.log_reload(true, "");
                ReconcileOutcome::Reloaded
            }
            Err(e) => {
                self.metrics.record_operation("reload", false);
                self.logger.log_reload(false, &e.to_string());
                ReconcileOutcome::Failed
            }
        }
    }

    async fn record_health(&self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Patched | ReconcileOutcome::Unchanged | ReconcileOutcome::Reloaded => {
                self.health.set_healthy(components::PROXY).await;
                self.health.set_ready(true).await;
            }
            ReconcileOutcome::Conflict(conflict) => {
                self.health
                    .set_degraded(components::PROXY, conflict.to_string())
                    .await;
            }
            ReconcileOutcome::ValidationFailed => {
                self.health
                    .set_degraded(components::PROXY, "generated configuration rejected")
                    .await;
            }
            ReconcileOutcome::Failed => {
                self.health
                    .set_degraded(components::PROXY, "configuration apply failed")
                    .await;
            }
            ReconcileOutcome::Skipped => {}
        }
    }
}
