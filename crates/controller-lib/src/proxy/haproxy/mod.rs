//! HAProxy config manager
//!
//! Keeps the model of the last applied state and uses it to decide between
//! live patching over the runtime API and a full render + reload. The cached
//! model is replaced only after a successful reload, or by the patched model
//! after every patch command succeeded.

pub mod diff;
pub mod model;
pub mod render;

pub use diff::{plan_patch, PatchPlan, RuntimeCommand, StructuralChange};
pub use model::{DefaultSettings, GlobalSettings, HaproxyModel, RealServer, MAX_WEIGHT};
pub use render::{HaproxyTextRenderer, TemplateRenderer};

use super::files::{ConfigFiles, FileLayout, RenderedConfig};
use super::process::{HaproxyBinary, ProxyProcess};
use super::runtime::{RuntimeApi, UnixSocketRuntime};
use super::{ConfigManager, ProxyKind};
use crate::error::ProxyError;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::service::ServiceSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the HAProxy manager
#[derive(Debug, Clone)]
pub struct HaproxyConfig {
    pub binary: PathBuf,
    pub files: FileLayout,
    pub pid_file: PathBuf,
    /// Runtime API socket, also rendered as `stats socket`
    pub stats_socket: PathBuf,
    pub runtime_timeout: Duration,
    pub max_conn: u32,
    pub nbthread: u32,
    /// Certificate (or directory) used by HTTPS frontends
    pub ssl_cert_path: String,
    pub defaults: DefaultSettings,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/haproxy"),
            files: FileLayout::new("/etc/haproxy/haproxy.cfg", "/var/lib/lb-controller/haproxy"),
            pid_file: PathBuf::from("/var/run/haproxy.pid"),
            stats_socket: PathBuf::from("/var/run/haproxy.sock"),
            runtime_timeout: Duration::from_secs(2),
            max_conn: 20_000,
            nbthread: 4,
            ssl_cert_path: "/etc/haproxy/certs".to_string(),
            defaults: DefaultSettings::default(),
        }
    }
}

impl HaproxyConfig {
    fn global(&self) -> GlobalSettings {
        GlobalSettings {
            stats_socket: self.stats_socket.display().to_string(),
            max_conn: self.max_conn,
            nbthread: self.nbthread,
            ssl_cert_path: self.ssl_cert_path.clone(),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    /// Model matching the running proxy
    cached: Option<HaproxyModel>,
    /// Model of the last rendered candidate
    pending: Option<HaproxyModel>,
    /// A patch failed midway; the running state is unknown
    diverged: bool,
}

pub struct HaproxyManager {
    config: HaproxyConfig,
    files: ConfigFiles,
    renderer: Box<dyn TemplateRenderer>,
    process: Arc<dyn ProxyProcess>,
    runtime: Arc<dyn RuntimeApi>,
    state: Mutex<ManagerState>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl HaproxyManager {
    /// Manager driving the real binary and stats socket
    pub fn new(config: HaproxyConfig) -> Self {
        let process = Arc::new(HaproxyBinary::new(&config.binary, &config.pid_file));
        let runtime = Arc::new(UnixSocketRuntime::new(
            &config.stats_socket,
            config.runtime_timeout,
        ));
        Self::with_parts(config, Box::new(HaproxyTextRenderer), process, runtime)
    }

    pub fn with_parts(
        config: HaproxyConfig,
        renderer: Box<dyn TemplateRenderer>,
        process: Arc<dyn ProxyProcess>,
        runtime: Arc<dyn RuntimeApi>,
    ) -> Self {
        Self {
            files: ConfigFiles::new(config.files.clone()),
            config,
            renderer,
            process,
            runtime,
            state: Mutex::new(ManagerState::default()),
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("haproxy"),
        }
    }

    pub fn build_model(&self, services: &ServiceSnapshot) -> HaproxyModel {
        HaproxyModel::build(services, self.config.global(), self.config.defaults.clone())
    }

    /// Model of the state last applied to the running proxy
    pub fn cached_model(&self) -> Option<HaproxyModel> {
        self.lock().cached.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Plan against the cached model; `None` means a reload is needed
    fn plan(&self, new: &HaproxyModel) -> Option<PatchPlan> {
        let state = self.lock();
        if state.diverged {
            debug!("Previous live patch failed, reload required");
            return None;
        }
        let Some(cached) = state.cached.as_ref() else {
            debug!("No applied configuration yet, reload required");
            return None;
        };
        match plan_patch(cached, new) {
            Ok(plan) => Some(plan),
            Err(change) => {
                info!(reason = %change, "Structural change, reload required");
                None
            }
        }
    }
}

#[async_trait]
impl ConfigManager for HaproxyManager {
    fn kind(&self) -> ProxyKind {
        ProxyKind::Haproxy
    }

    async fn try_update_without_reload(&self, services: &ServiceSnapshot) -> bool {
        let new = self.build_model(services);
        let Some(plan) = self.plan(&new) else {
            return true;
        };

        if plan.is_empty() {
            debug!("Running configuration already up to date");
            return false;
        }

        for command in &plan.commands {
            let line = command.to_string();
            match self.runtime.execute(&line).await {
                Ok(_) => self.metrics.record_runtime_command(true),
                Err(e) => {
                    self.metrics.record_runtime_command(false);
                    self.metrics.record_operation("patch", false);
                    warn!(command = %line, error = %e, "Runtime command failed, falling back to reload");
                    self.lock().diverged = true;
                    return true;
                }
            }
        }

        self.lock().cached = Some(plan.patched);
        self.metrics.record_operation("patch", true);
        self.logger.log_live_patch(plan.commands.len());
        false
    }

    async fn create(&self, services: &ServiceSnapshot) -> Result<RenderedConfig, ProxyError> {
        let model = self.build_model(services);
        let text = self.renderer.render(&model)?;
        let candidate = self.files.write_candidate(&text).await?;
        debug!(
            servers = model.server_count(),
            checksum = %candidate.checksum,
            "HAProxy candidate rendered"
        );
        self.lock().pending = Some(model);
        Ok(candidate)
    }

    async fn check_difference(&self, candidate: &RenderedConfig) -> Result<bool, ProxyError> {
        self.files.differs(candidate).await
    }

    async fn validate(&self, candidate: &RenderedConfig) -> Result<(), ProxyError> {
        self.process.validate(&candidate.path).await
    }

    async fn replace(&self, candidate: &RenderedConfig) -> Result<(), ProxyError> {
        self.files.replace(candidate).await
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        match self.process.reload(self.files.active_path()).await {
            Ok(()) => {
                let mut state = self.lock();
                if let Some(model) = state.pending.take() {
                    state.cached = Some(model);
                }
                state.diverged = false;
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self.files.restore_previous().await {
                    error!(error = %restore, "Failed to restore previous configuration");
                }
                Err(e)
            }
        }
    }

    fn requires_full_apply(&self) -> bool {
        let state = self.lock();
        state.cached.is_none() || state.diverged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use crate::proxy::testing::{FakeProcess, RecordingRuntime};
    use crate::service::{BackendServer, HttpServiceInfo};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: HaproxyManager,
        process: Arc<FakeProcess>,
        runtime: Arc<RecordingRuntime>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = HaproxyConfig {
            files: FileLayout::new(dir.path().join("haproxy.cfg"), dir.path().join("work")),
            stats_socket: dir.path().join("haproxy.sock"),
            ..Default::default()
        };
        let process = Arc::new(FakeProcess::default());
        let runtime = Arc::new(RecordingRuntime::default());
        let manager = HaproxyManager::with_parts(
            config,
            Box::new(HaproxyTextRenderer),
            process.clone(),
            runtime.clone(),
        );
        Fixture {
            _dir: dir,
            manager,
            process,
            runtime,
        }
    }

    fn snapshot(ips: &[(&str, u32)]) -> ServiceSnapshot {
        ServiceSnapshot {
            http: vec![HttpServiceInfo {
                name: "ns_svc1_8080_x_com".to_string(),
                service_key: "ns.svc1".to_string(),
                protocol: Protocol::Http,
                service_port: 8080,
                vhost: "x.com".to_string(),
                path: "/".to_string(),
                balance: "roundrobin".to_string(),
                backends: ips
                    .iter()
                    .map(|(ip, weight)| BackendServer {
                        ip: ip.to_string(),
                        port: 80,
                        label: String::new(),
                        weight: *weight,
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    async fn full_apply(manager: &HaproxyManager, services: &ServiceSnapshot) {
        let candidate = manager.create(services).await.unwrap();
        manager.validate(&candidate).await.unwrap();
        manager.replace(&candidate).await.unwrap();
        manager.reload().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_pass_requires_reload() {
        let fx = fixture();
        assert!(fx.manager.requires_full_apply());
        assert!(fx.manager.try_update_without_reload(&snapshot(&[("10.0.0.1", 1)])).await);
        assert!(fx.runtime.commands().is_empty());
    }

    #[tokio::test]
    async fn test_reload_commits_pending_model() {
        let fx = fixture();
        let services = snapshot(&[("10.0.0.1", 1)]);
        full_apply(&fx.manager, &services).await;

        assert!(!fx.manager.requires_full_apply());
        assert_eq!(fx.manager.cached_model(), Some(fx.manager.build_model(&services)));
        assert_eq!(fx.process.reloads(), 1);
    }

    #[tokio::test]
    async fn test_weight_change_patched_live() {
        let fx = fixture();
        full_apply(&fx.manager, &snapshot(&[("10.0.0.1", 1), ("10.0.0.2", 1)])).await;

        let needs_reload = fx
            .manager
            .try_update_without_reload(&snapshot(&[("10.0.0.1", 1), ("10.0.0.2", 5)]))
            .await;
        assert!(!needs_reload);
        assert_eq!(
            fx.runtime.commands(),
            vec!["set server ns_svc1_8080_x_com/srv1 weight 5"]
        );

        let cached = fx.manager.cached_model().unwrap();
        assert_eq!(
            cached.http_frontends[&8080].backends["ns_svc1_8080_x_com"].servers[1].weight,
            5
        );
    }

    #[tokio::test]
    async fn test_failed_command_forces_reload() {
        let fx = fixture();
        full_apply(&fx.manager, &snapshot(&[("10.0.0.1", 1)])).await;
        fx.runtime.fail_matching("addr");

        let services = snapshot(&[("10.0.0.9", 1)]);
        assert!(fx.manager.try_update_without_reload(&services).await);
        assert!(fx.manager.requires_full_apply());

        // Still diverged: no further patch attempts until a reload succeeds
        fx.runtime.clear();
        assert!(fx.manager.try_update_without_reload(&services).await);
        assert!(fx.runtime.commands().is_empty());

        full_apply(&fx.manager, &services).await;
        assert!(!fx.manager.requires_full_apply());
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_cached_model_and_restores_file() {
        let fx = fixture();
        let first = snapshot(&[("10.0.0.1", 1)]);
        full_apply(&fx.manager, &first).await;
        let applied = std::fs::read_to_string(fx.manager.files.active_path()).unwrap();

        fx.process
            .fail_reload
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let second = snapshot(&[("10.0.0.1", 1), ("10.0.0.2", 1)]);
        let candidate = fx.manager.create(&second).await.unwrap();
        fx.manager.replace(&candidate).await.unwrap();
        assert!(fx.manager.reload().await.is_err());

        assert_eq!(fx.manager.cached_model(), Some(fx.manager.build_model(&first)));
        let active = std::fs::read_to_string(fx.manager.files.active_path()).unwrap();
        assert_eq!(active, applied);
        assert!(fx.manager.check_difference(&candidate).await.unwrap());
    }

    #[tokio::test]
    async fn test_unchanged_state_is_noop() {
        let fx = fixture();
        let services = snapshot(&[("10.0.0.1", 1)]);
        full_apply(&fx.manager, &services).await;

        assert!(!fx.manager.try_update_without_reload(&services).await);
        assert!(fx.runtime.commands().is_empty());
    }
}
