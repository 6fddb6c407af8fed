//! HAProxy configuration model
//!
//! Built fresh from a [`ServiceSnapshot`] on every pass and compared field
//! by field against the model of the last applied state.

use crate::service::{BackendServer, HttpServiceInfo, ServiceSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Highest weight HAProxy accepts for a server
pub const MAX_WEIGHT: u32 = 256;

/// `global` section settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalSettings {
    pub stats_socket: String,
    pub max_conn: u32,
    pub nbthread: u32,
    pub ssl_cert_path: String,
}

/// `defaults` section settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultSettings {
    pub timeout_connect_ms: u64,
    pub timeout_client_ms: u64,
    pub timeout_server_ms: u64,
    pub options: Vec<String>,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            timeout_connect_ms: 5_000,
            timeout_client_ms: 50_000,
            timeout_server_ms: 50_000,
            options: vec!["dontlognull".to_string(), "redispatch".to_string()],
        }
    }
}

/// One upstream server slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealServer {
    /// Stable slot name, assigned by position after sorting by address
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub disabled: bool,
}

impl RealServer {
    /// Identity of the server (`ip:port`)
    pub fn address(&self) -> (String, u16) {
        (self.ip.clone(), self.port)
    }
}

/// A routed HTTP backend inside a frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpBackend {
    pub name: String,
    pub host: String,
    pub path: String,
    pub balance: String,
    pub servers: Vec<RealServer>,
}

/// An HTTP or HTTPS frontend bound to one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frontend {
    pub name: String,
    pub port: u16,
    /// Backends keyed by backend name
    pub backends: BTreeMap<String, HttpBackend>,
}

/// A TCP `listen` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpListener {
    pub name: String,
    pub port: u16,
    pub balance: String,
    pub servers: Vec<RealServer>,
}

/// Full structural model of one HAProxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaproxyModel {
    pub global: GlobalSettings,
    pub defaults: DefaultSettings,
    pub http_frontends: BTreeMap<u16, Frontend>,
    pub https_frontends: BTreeMap<u16, Frontend>,
    pub tcp_listeners: BTreeMap<u16, TcpListener>,
}

impl HaproxyModel {
    /// Build the model for a conflict-free snapshot
    pub fn build(snapshot: &ServiceSnapshot, global: GlobalSettings, defaults: DefaultSettings) -> Self {
        let tcp_listeners = snapshot
            .tcp
            .iter()
            .map(|svc| {
                let listener = TcpListener {
                    name: svc.name.clone(),
                    port: svc.service_port,
                    balance: svc.balance.clone(),
                    servers: real_servers(&svc.backends),
                };
                (svc.service_port, listener)
            })
            .collect();

        for svc in &snapshot.udp {
            warn!(
                service = %svc.name,
                port = svc.service_port,
                "HAProxy cannot balance UDP, skipping"
            );
        }

        Self {
            global,
            defaults,
            http_frontends: frontends("http", &snapshot.http),
            https_frontends: frontends("https", &snapshot.https),
            tcp_listeners,
        }
    }

    /// Number of server slots across all sections
    pub fn server_count(&self) -> usize {
        let http: usize = self
            .http_frontends
            .values()
            .chain(self.https_frontends.values())
            .flat_map(|f| f.backends.values())
            .map(|b| b.servers.len())
            .sum();
        let tcp: usize = self.tcp_listeners.values().map(|l| l.servers.len()).sum();
        http + tcp
    }
}

fn frontends(prefix: &str, services: &[HttpServiceInfo]) -> BTreeMap<u16, Frontend> {
    let mut frontends: BTreeMap<u16, Frontend> = BTreeMap::new();
    for svc in services {
        let frontend = frontends.entry(svc.service_port).or_insert_with(|| Frontend {
            name: format!("{}_{}", prefix, svc.service_port),
            port: svc.service_port,
            backends: BTreeMap::new(),
        });
        let replaced = frontend.backends.insert(
            svc.name.clone(),
            HttpBackend {
                name: svc.name.clone(),
                host: svc.vhost.clone(),
                path: svc.path.clone(),
                balance: svc.balance.clone(),
                servers: real_servers(&svc.backends),
            },
        );
        if let Some(previous) = replaced {
            warn!(backend = %previous.name, path = %previous.path, "Duplicate backend name, route replaced");
        }
    }
    frontends
}

/// Slots named by position; backends arrive sorted by address
fn real_servers(backends: &[BackendServer]) -> Vec<RealServer> {
    backends
        .iter()
        .enumerate()
        .map(|(idx, backend)| RealServer {
            name: format!("srv{}", idx),
            ip: backend.ip.clone(),
            port: backend.port,
            weight: backend.weight.min(MAX_WEIGHT),
            disabled: false,
        })
        .collect()
}
