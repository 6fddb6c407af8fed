//! Observability infrastructure for the load balancer controller
//!
//! Provides:
//! - Prometheus metrics (watch events, conflicts, config operations, runtime
//!   commands, reconcile latency, service counts)
//! - Structured JSON logging with tracing

use crate::service::ServiceSnapshot;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for a reconciliation pass (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    watch_events: IntCounterVec,
    config_conflicts: IntCounter,
    config_operations: IntCounterVec,
    runtime_commands: IntCounterVec,
    reconcile_duration_seconds: Histogram,
    services: IntGaugeVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            watch_events: register_int_counter_vec!(
                "lb_controller_watch_events_total",
                "Coordination store events handled by the reflector",
                &["event"]
            )
            .expect("Failed to register watch_events_total"),

            config_conflicts: register_int_counter!(
                "lb_controller_config_conflicts_total",
                "Reconciliation passes aborted by a listening address conflict"
            )
            .expect("Failed to register config_conflicts_total"),

            config_operations: register_int_counter_vec!(
                "lb_controller_config_operations_total",
                "Proxy configuration operations by outcome",
                &["operation", "result"]
            )
            .expect("Failed to register config_operations_total"),

            runtime_commands: register_int_counter_vec!(
                "lb_controller_runtime_commands_total",
                "Commands sent to the proxy runtime API",
                &["result"]
            )
            .expect("Failed to register runtime_commands_total"),

            reconcile_duration_seconds: register_histogram!(
                "lb_controller_reconcile_duration_seconds",
                "Time spent in one reconciliation pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            services: register_int_gauge_vec!(
                "lb_controller_services",
                "Normalized service entries in the last listed snapshot",
                &["protocol"]
            )
            .expect("Failed to register services"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    inner: &'static ControllerMetricsInner,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a handle, registering the global metrics on first use
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new),
        }
    }

    pub fn inc_watch_event(&self, event: &str) {
        self.inner.watch_events.with_label_values(&[event]).inc();
    }

    pub fn inc_conflicts(&self) {
        self.inner.config_conflicts.inc();
    }

    /// Count a config operation (`create`, `validate`, `replace`, `reload`, `patch`)
    pub fn record_operation(&self, operation: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.inner
            .config_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_runtime_command(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.inner.runtime_commands.with_label_values(&[result]).inc();
    }

    pub fn observe_reconcile(&self, duration_secs: f64) {
        self.inner.reconcile_duration_seconds.observe(duration_secs);
    }

    /// Publish per-protocol entry counts of a snapshot
    pub fn set_services(&self, snapshot: &ServiceSnapshot) {
        let counts = [
            ("http", snapshot.http.len()),
            ("https", snapshot.https.len()),
            ("tcp", snapshot.tcp.len()),
            ("udp", snapshot.udp.len()),
        ];
        for (protocol, count) in counts {
            self.inner
                .services
                .with_label_values(&[protocol])
                .set(count as i64);
        }
    }
}

/// Structured logger for controller events
///
/// Consistent JSON-formatted logging for reconciliation outcomes and
/// lifecycle events, tagged with the controller instance.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, proxy: &str, group: &str) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            controller_version = %version,
            proxy = %proxy,
            group = %group,
            "Load balancer controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Load balancer controller shutting down"
        );
    }

    pub fn log_conflict(&self, address: &str, first: &str, second: &str) {
        warn!(
            event = "config_conflict",
            instance = %self.instance,
            address = %address,
            first = %first,
            second = %second,
            "Listening address conflict, configuration left unchanged"
        );
    }

    /// Log a change applied through the runtime API
    pub fn log_live_patch(&self, commands: usize) {
        info!(
            event = "config_patched",
            instance = %self.instance,
            commands = commands,
            "Applied backend changes without reload"
        );
    }

    pub fn log_reload(&self, success: bool, detail: &str) {
        if success {
            info!(
                event = "proxy_reloaded",
                instance = %self.instance,
                "Proxy reloaded with new configuration"
            );
        } else {
            warn!(
                event = "proxy_reload_failed",
                instance = %self.instance,
                detail = %detail,
                "Proxy reload failed, previous configuration restored"
            );
        }
    }

    pub fn log_validation_failed(&self, detail: &str) {
        warn!(
            event = "config_invalid",
            instance = %self.instance,
            detail = %detail,
            "Generated configuration rejected by validator"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_shared_handle() {
        let metrics = ControllerMetrics::new();
        let other = ControllerMetrics::default();

        metrics.inc_watch_event("add");
        other.inc_watch_event("add");
        metrics.inc_conflicts();
        metrics.record_operation("reload", true);
        metrics.record_runtime_command(false);
        metrics.observe_reconcile(0.01);
        metrics.set_services(&ServiceSnapshot::default());

        assert!(metrics.inner.watch_events.with_label_values(&["add"]).get() >= 2);
        assert_eq!(metrics.inner.services.with_label_values(&["tcp"]).get(), 0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("lb-0");
        assert_eq!(logger.instance, "lb-0");
    }
}
