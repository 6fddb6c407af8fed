//! Controller configuration
//!
//! Loaded from an optional file named by `LB_CONFIG_FILE`, overlaid by
//! `LB_`-prefixed environment variables with `__` separating nested keys
//! (e.g. `LB_PROXY__KIND=nginx`, `LB_REFLECTOR__GROUP=internal`).

use anyhow::{Context, Result};
use controller_lib::proxy::haproxy::DefaultSettings;
use controller_lib::proxy::{FileLayout, HaproxyConfig, NginxConfig, ProxyKind};
use controller_lib::{ProcessorConfig, ReflectorConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub reflector: ReflectorSettings,

    #[serde(default)]
    pub processor: ProcessorSettings,

    #[serde(default)]
    pub proxy: ProxySettings,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    9180
}

/// Local directory mirroring the coordination store
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub base_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/lb-controller/store"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReflectorSettings {
    pub watch_path: String,
    pub group: String,
    pub sync_period_secs: u64,
    pub retry_delay_secs: u64,
}

impl Default for ReflectorSettings {
    fn default() -> Self {
        let defaults = ReflectorConfig::default();
        Self {
            watch_path: defaults.watch_path,
            group: defaults.group,
            sync_period_secs: defaults.sync_period.as_secs(),
            retry_delay_secs: defaults.retry_delay.as_secs(),
        }
    }
}

impl ReflectorSettings {
    pub fn to_config(&self) -> ReflectorConfig {
        ReflectorConfig {
            watch_path: self.watch_path.clone(),
            group: self.group.clone(),
            sync_period: Duration::from_secs(self.sync_period_secs.max(1)),
            retry_delay: Duration::from_secs(self.retry_delay_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub check_period_secs: u64,
    pub sync_period_secs: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        let defaults = ProcessorConfig::default();
        Self {
            check_period_secs: defaults.check_period.as_secs(),
            sync_period_secs: defaults.sync_period.as_secs(),
        }
    }
}

impl ProcessorSettings {
    pub fn to_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            check_period: Duration::from_secs(self.check_period_secs.max(1)),
            sync_period: Duration::from_secs(self.sync_period_secs.max(1)),
        }
    }
}

/// Proxy engine selection and file locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub binary: Option<PathBuf>,
    /// Active configuration file; engine default when unset
    pub config_path: Option<PathBuf>,
    /// Holds the staging and backup directories
    pub work_dir: PathBuf,
    pub backups_to_keep: usize,
    pub haproxy: HaproxySettings,
    pub nginx: NginxSettings,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            kind: ProxyKind::Haproxy,
            binary: None,
            config_path: None,
            work_dir: PathBuf::from("/var/lib/lb-controller"),
            backups_to_keep: 5,
            haproxy: HaproxySettings::default(),
            nginx: NginxSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HaproxySettings {
    pub pid_file: PathBuf,
    pub stats_socket: PathBuf,
    pub runtime_timeout_secs: u64,
    pub max_conn: u32,
    pub nbthread: u32,
    pub ssl_cert_path: String,
    pub timeout_connect_ms: u64,
    pub timeout_client_ms: u64,
    pub timeout_server_ms: u64,
}

impl Default for HaproxySettings {
    fn default() -> Self {
        let defaults = HaproxyConfig::default();
        Self {
            pid_file: defaults.pid_file,
            stats_socket: defaults.stats_socket,
            runtime_timeout_secs: defaults.runtime_timeout.as_secs(),
            max_conn: defaults.max_conn,
            nbthread: defaults.nbthread,
            ssl_cert_path: defaults.ssl_cert_path,
            timeout_connect_ms: defaults.defaults.timeout_connect_ms,
            timeout_client_ms: defaults.defaults.timeout_client_ms,
            timeout_server_ms: defaults.defaults.timeout_server_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NginxSettings {
    pub worker_processes: String,
    pub worker_connections: u32,
    pub ssl_certificate: String,
    pub ssl_certificate_key: String,
}

impl Default for NginxSettings {
    fn default() -> Self {
        let defaults = NginxConfig::default();
        Self {
            worker_processes: defaults.worker_processes,
            worker_connections: defaults.worker_connections,
            ssl_certificate: defaults.ssl_certificate,
            ssl_certificate_key: defaults.ssl_certificate_key,
        }
    }
}

impl ProxySettings {
    fn layout(&self, default_config: PathBuf) -> FileLayout {
        let mut layout = FileLayout::new(
            self.config_path.clone().unwrap_or(default_config),
            self.work_dir.join(self.kind.to_string()),
        );
        layout.backups_to_keep = self.backups_to_keep;
        layout
    }

    pub fn haproxy_config(&self) -> HaproxyConfig {
        let defaults = HaproxyConfig::default();
        let settings = &self.haproxy;
        HaproxyConfig {
            binary: self.binary.clone().unwrap_or(defaults.binary),
            files: self.layout(defaults.files.config_path),
            pid_file: settings.pid_file.clone(),
            stats_socket: settings.stats_socket.clone(),
            runtime_timeout: Duration::from_secs(settings.runtime_timeout_secs.max(1)),
            max_conn: settings.max_conn,
            nbthread: settings.nbthread,
            ssl_cert_path: settings.ssl_cert_path.clone(),
            defaults: DefaultSettings {
                timeout_connect_ms: settings.timeout_connect_ms,
                timeout_client_ms: settings.timeout_client_ms,
                timeout_server_ms: settings.timeout_server_ms,
                ..DefaultSettings::default()
            },
        }
    }

    pub fn nginx_config(&self) -> NginxConfig {
        let defaults = NginxConfig::default();
        let settings = &self.nginx;
        NginxConfig {
            binary: self.binary.clone().unwrap_or(defaults.binary),
            files: self.layout(defaults.files.config_path),
            worker_processes: settings.worker_processes.clone(),
            worker_connections: settings.worker_connections,
            ssl_certificate: settings.ssl_certificate.clone(),
            ssl_certificate_key: settings.ssl_certificate_key.clone(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("LB_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("LB")
                .prefix_separator("_")
                .separator("__"),
        );
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("failed to read controller configuration")?
            .try_deserialize()
            .context("invalid controller configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sources() {
        let config = ControllerConfig::from_builder(config::Config::builder()).unwrap();
        assert_eq!(config.api_port, 9180);
        assert_eq!(config.proxy.kind, ProxyKind::Haproxy);
        assert_eq!(config.reflector.to_config().sync_period, Duration::from_secs(60));
        assert_eq!(config.processor.to_config().check_period, Duration::from_secs(3));

        let haproxy = config.proxy.haproxy_config();
        assert_eq!(haproxy.files.config_path, PathBuf::from("/etc/haproxy/haproxy.cfg"));
        assert_eq!(
            haproxy.files.staging_dir,
            PathBuf::from("/var/lib/lb-controller/haproxy/staging")
        );
    }

    #[test]
    fn test_nested_overrides() {
        let builder = config::Config::builder()
            .set_override("proxy.kind", "nginx")
            .unwrap()
            .set_override("proxy.config_path", "/tmp/nginx.conf")
            .unwrap()
            .set_override("proxy.backups_to_keep", 2)
            .unwrap()
            .set_override("reflector.group", "internal")
            .unwrap()
            .set_override("processor.sync_period_secs", 0)
            .unwrap();
        let config = ControllerConfig::from_builder(builder).unwrap();

        assert_eq!(config.proxy.kind, ProxyKind::Nginx);
        assert_eq!(config.reflector.group, "internal");
        // Zero periods would spin the timers
        assert_eq!(config.processor.to_config().sync_period, Duration::from_secs(1));

        let nginx = config.proxy.nginx_config();
        assert_eq!(nginx.files.config_path, PathBuf::from("/tmp/nginx.conf"));
        assert_eq!(nginx.files.backups_to_keep, 2);
        assert_eq!(nginx.binary, PathBuf::from("/usr/sbin/nginx"));
    }
}
