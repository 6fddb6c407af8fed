//! HAProxy configuration text rendering

use super::model::{Frontend, HaproxyModel, RealServer};
use crate::error::ProxyError;
use std::fmt::Write;

/// Turns a model into configuration file text
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, model: &HaproxyModel) -> Result<String, ProxyError>;
}

/// Renders native `haproxy.cfg` syntax
#[derive(Debug, Default, Clone, Copy)]
pub struct HaproxyTextRenderer;

impl TemplateRenderer for HaproxyTextRenderer {
    fn render(&self, model: &HaproxyModel) -> Result<String, ProxyError> {
        render_model(model).map_err(|e| ProxyError::Render(e.to_string()))
    }
}

fn render_model(model: &HaproxyModel) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "# Generated by lb-controller, do not edit")?;

    let global = &model.global;
    writeln!(out, "global")?;
    writeln!(out, "    maxconn {}", global.max_conn)?;
    writeln!(out, "    nbthread {}", global.nbthread)?;
    writeln!(out, "    stats socket {} mode 600 level admin", global.stats_socket)?;
    writeln!(out)?;

    let defaults = &model.defaults;
    writeln!(out, "defaults")?;
    writeln!(out, "    timeout connect {}ms", defaults.timeout_connect_ms)?;
    writeln!(out, "    timeout client {}ms", defaults.timeout_client_ms)?;
    writeln!(out, "    timeout server {}ms", defaults.timeout_server_ms)?;
    for option in &defaults.options {
        writeln!(out, "    option {}", option)?;
    }

    for frontend in model.http_frontends.values() {
        write_frontend(&mut out, frontend, None)?;
    }
    for frontend in model.https_frontends.values() {
        write_frontend(&mut out, frontend, Some(&global.ssl_cert_path))?;
    }

    for listener in model.tcp_listeners.values() {
        writeln!(out)?;
        writeln!(out, "listen {}", listener.name)?;
        writeln!(out, "    bind *:{}", listener.port)?;
        writeln!(out, "    mode tcp")?;
        writeln!(out, "    balance {}", listener.balance)?;
        write_servers(&mut out, &listener.servers)?;
    }

    Ok(out)
}

fn write_frontend(out: &mut String, frontend: &Frontend, cert: Option<&str>) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(out, "frontend {}", frontend.name)?;
    match cert {
        Some(cert) => writeln!(out, "    bind *:{} ssl crt {}", frontend.port, cert)?,
        None => writeln!(out, "    bind *:{}", frontend.port)?,
    }
    writeln!(out, "    mode http")?;

    // Longest path first so the most specific route wins
    let mut backends: Vec<_> = frontend.backends.values().collect();
    backends.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.name.cmp(&b.name)));

    for backend in &backends {
        let mut conditions = Vec::new();
        if !backend.host.is_empty() {
            writeln!(
                out,
                "    acl host_{} hdr(host),field(1,:) -i {}",
                backend.name, backend.host
            )?;
            conditions.push(format!("host_{}", backend.name));
        }
        if backend.path != "/" {
            writeln!(out, "    acl path_{} path_beg {}", backend.name, backend.path)?;
            conditions.push(format!("path_{}", backend.name));
        }
        if conditions.is_empty() {
            writeln!(out, "    default_backend {}", backend.name)?;
        } else {
            writeln!(out, "    use_backend {} if {}", backend.name, conditions.join(" "))?;
        }
    }

    for backend in &backends {
        writeln!(out)?;
        writeln!(out, "backend {}", backend.name)?;
        writeln!(out, "    mode http")?;
        writeln!(out, "    balance {}", backend.balance)?;
        write_servers(out, &backend.servers)?;
    }
    Ok(())
}

fn write_servers(out: &mut String, servers: &[RealServer]) -> std::fmt::Result {
    for server in servers {
        write!(
            out,
            "    server {} {}:{} weight {} check",
            server.name, server.ip, server.port, server.weight
        )?;
        if server.disabled {
            write!(out, " disabled")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
