//! NGINX config manager
//!
//! NGINX has no runtime API for upstream changes, so every change goes
//! through render, validate, replace and reload. HTTP and HTTPS entries
//! become `server` blocks grouped by (port, virtual host); TCP and UDP
//! entries become `stream` servers.

use super::files::{ConfigFiles, FileLayout, RenderedConfig};
use super::process::{NginxBinary, ProxyProcess};
use super::{ConfigManager, ProxyKind};
use crate::error::ProxyError;
use crate::models::Protocol;
use crate::service::{BackendServer, HttpServiceInfo, Layer4ServiceInfo, ServiceSnapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct NginxConfig {
    pub binary: PathBuf,
    pub files: FileLayout,
    pub worker_processes: String,
    pub worker_connections: u32,
    pub ssl_certificate: String,
    pub ssl_certificate_key: String,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/nginx"),
            files: FileLayout::new("/etc/nginx/nginx.conf", "/var/lib/lb-controller/nginx"),
            worker_processes: "auto".to_string(),
            worker_connections: 10_240,
            ssl_certificate: "/etc/nginx/certs/tls.crt".to_string(),
            ssl_certificate_key: "/etc/nginx/certs/tls.key".to_string(),
        }
    }
}

pub struct NginxManager {
    config: NginxConfig,
    files: ConfigFiles,
    process: Arc<dyn ProxyProcess>,
    applied: AtomicBool,
}

impl NginxManager {
    pub fn new(config: NginxConfig) -> Self {
        let process = Arc::new(NginxBinary::new(&config.binary));
        Self::with_process(config, process)
    }

    pub fn with_process(config: NginxConfig, process: Arc<dyn ProxyProcess>) -> Self {
        Self {
            files: ConfigFiles::new(config.files.clone()),
            config,
            process,
            applied: AtomicBool::new(false),
        }
    }

    /// Render the full `nginx.conf` for a snapshot
    pub fn render(&self, services: &ServiceSnapshot) -> Result<String, ProxyError> {
        render_config(&self.config, services).map_err(|e| ProxyError::Render(e.to_string()))
    }
}

#[async_trait]
impl ConfigManager for NginxManager {
    fn kind(&self) -> ProxyKind {
        ProxyKind::Nginx
    }

    async fn try_update_without_reload(&self, _services: &ServiceSnapshot) -> bool {
        true
    }

    async fn create(&self, services: &ServiceSnapshot) -> Result<RenderedConfig, ProxyError> {
        let text = self.render(services)?;
        let candidate = self.files.write_candidate(&text).await?;
        debug!(checksum = %candidate.checksum, "NGINX candidate rendered");
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
                self.applied.store(true, Ordering::SeqCst);
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
        !self.applied.load(Ordering::SeqCst)
    }
}

fn render_config(config: &NginxConfig, services: &ServiceSnapshot) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "# Generated by lb-controller, do not edit")?;
    writeln!(out, "worker_processes {};", config.worker_processes)?;
    writeln!(out, "events {{")?;
    writeln!(out, "    worker_connections {};", config.worker_connections)?;
    writeln!(out, "}}")?;

    writeln!(out)?;
    writeln!(out, "http {{")?;
    for svc in services.http.iter().chain(services.https.iter()) {
        write_upstream(&mut out, "    ", &svc.name, &svc.balance, &svc.backends)?;
    }

    // (port, vhost) -> locations, HTTPS flagged per port
    let mut servers: BTreeMap<(u16, String), (bool, Vec<&HttpServiceInfo>)> = BTreeMap::new();
    for svc in services.http.iter().chain(services.https.iter()) {
        let entry = servers
            .entry((svc.service_port, svc.vhost.clone()))
            .or_insert_with(|| (false, Vec::new()));
        entry.0 |= svc.protocol == Protocol::Https;
        entry.1.push(svc);
    }

    for ((port, vhost), (tls, mut locations)) in servers {
        locations.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.name.cmp(&b.name)));
        writeln!(out, "    server {{")?;
        if tls {
            writeln!(out, "        listen {} ssl;", port)?;
            writeln!(out, "        ssl_certificate {};", config.ssl_certificate)?;
            writeln!(out, "        ssl_certificate_key {};", config.ssl_certificate_key)?;
        } else {
            writeln!(out, "        listen {};", port)?;
        }
        let name = if vhost.is_empty() { "_" } else { vhost.as_str() };
        writeln!(out, "        server_name {};", name)?;
        for svc in locations {
            writeln!(out, "        location {} {{", svc.path)?;
            writeln!(out, "            proxy_set_header Host $host;")?;
            writeln!(out, "            proxy_pass http://{};", svc.name)?;
            writeln!(out, "        }}")?;
        }
        writeln!(out, "    }}")?;
    }
    writeln!(out, "}}")?;

    if !services.tcp.is_empty() || !services.udp.is_empty() {
        writeln!(out)?;
        writeln!(out, "stream {{")?;
        for svc in services.tcp.iter().chain(services.udp.iter()) {
            write_stream(&mut out, svc)?;
        }
        writeln!(out, "}}")?;
    }
    Ok(out)
}

fn write_stream(out: &mut String, svc: &Layer4ServiceInfo) -> std::fmt::Result {
    write_upstream(out, "    ", &svc.name, &svc.balance, &svc.backends)?;
    writeln!(out, "    server {{")?;
    if svc.protocol == Protocol::Udp {
        writeln!(out, "        listen {} udp;", svc.service_port)?;
    } else {
        writeln!(out, "        listen {};", svc.service_port)?;
    }
    writeln!(out, "        proxy_pass {};", svc.name)?;
    writeln!(out, "    }}")
}

fn write_upstream(
    out: &mut String,
    indent: &str,
    name: &str,
    balance: &str,
    backends: &[BackendServer],
) -> std::fmt::Result {
    writeln!(out, "{indent}upstream {} {{", name)?;
    match balance {
        "source" => writeln!(out, "{indent}    hash $remote_addr consistent;")?,
        "leastconn" => writeln!(out, "{indent}    least_conn;")?,
        _ => {}
    }
    for backend in backends {
        // NGINX weights start at 1; a zero weight takes the server out
        if backend.weight == 0 {
            writeln!(out, "{indent}    server {}:{} down;", backend.ip, backend.port)?;
        } else {
            writeln!(
                out,
                "{indent}    server {}:{} weight={};",
                backend.ip, backend.port, backend.weight
            )?;
        }
    }
    writeln!(out, "{indent}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::FakeProcess;
    use tempfile::TempDir;

    fn backend(ip: &str, weight: u32) -> BackendServer {
        BackendServer {
            ip: ip.to_string(),
            port: 80,
            label: String::new(),
            weight,
        }
    }

    fn snapshot() -> ServiceSnapshot {
        ServiceSnapshot {
            http: vec![
                HttpServiceInfo {
                    name: "ns_web_80_x_com".to_string(),
                    service_key: "ns.web".to_string(),
                    protocol: Protocol::Http,
                    service_port: 80,
                    vhost: "x.com".to_string(),
                    path: "/".to_string(),
                    balance: "roundrobin".to_string(),
                    backends: vec![backend("10.0.0.1", 2), backend("10.0.0.2", 0)],
                },
                HttpServiceInfo {
                    name: "ns_api_80_x_com_api".to_string(),
                    service_key: "ns.api".to_string(),
                    protocol: Protocol::Http,
                    service_port: 80,
                    vhost: "x.com".to_string(),
                    path: "/api".to_string(),
                    balance: "leastconn".to_string(),
                    backends: vec![backend("10.0.0.3", 1)],
                },
            ],
            udp: vec![Layer4ServiceInfo {
                name: "ns_dns_53".to_string(),
                service_key: "ns.dns".to_string(),
                protocol: Protocol::Udp,
                service_port: 53,
                balance: "source".to_string(),
                backends: vec![backend("10.0.0.9", 1)],
            }],
            ..Default::default()
        }
    }

    fn manager(dir: &TempDir) -> (NginxManager, Arc<FakeProcess>) {
        let config = NginxConfig {
            files: FileLayout::new(dir.path().join("nginx.conf"), dir.path().join("work")),
            ..Default::default()
        };
        let process = Arc::new(FakeProcess::default());
        (NginxManager::with_process(config, process.clone()), process)
    }

    #[test]
    fn test_render_http_and_stream() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir);
        let text = manager.render(&snapshot()).unwrap();

        assert!(text.contains("upstream ns_web_80_x_com {"));
        assert!(text.contains("server 10.0.0.1:80 weight=2;"));
        assert!(text.contains("server 10.0.0.2:80 down;"));
        assert!(text.contains("least_conn;"));
        assert!(text.contains("server_name x.com;"));
        assert!(text.contains("listen 53 udp;"));
        assert!(text.contains("hash $remote_addr consistent;"));

        let api = text.find("location /api {").unwrap();
        let root = text.find("location / {").unwrap();
        assert!(api < root);
    }

    #[tokio::test]
    async fn test_every_change_needs_reload() {
        let dir = TempDir::new().unwrap();
        let (manager, process) = manager(&dir);
        let services = snapshot();

        assert!(manager.try_update_without_reload(&services).await);
        assert!(manager.requires_full_apply());

        let candidate = manager.create(&services).await.unwrap();
        assert!(manager.check_difference(&candidate).await.unwrap());
        manager.validate(&candidate).await.unwrap();
        manager.replace(&candidate).await.unwrap();
        manager.reload().await.unwrap();

        assert!(!manager.requires_full_apply());
        assert_eq!(process.reloads(), 1);

        let again = manager.create(&services).await.unwrap();
        assert!(!manager.check_difference(&again).await.unwrap());
    }
}
