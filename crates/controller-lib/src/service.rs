//! Normalized service view
//!
//! Read-only projection of exported services into per-protocol lists,
//! rebuilt on every reconciliation pass. Ports sharing a service port (and,
//! for layer 7, the same virtual host and path) are merged into one entry.
//! Backend weights are derived here, not at cache-write time, so edits to a
//! weight table alone produce a fresh derivation.

use crate::models::{ExportPort, ExportedService, Protocol};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Balance algorithm used when a service does not specify one
pub const DEFAULT_BALANCE: &str = "roundrobin";

/// A backend with its derived weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendServer {
    pub ip: String,
    pub port: u16,
    pub label: String,
    pub weight: u32,
}

/// HTTP or HTTPS entry, unique per (virtual host, service port, path)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpServiceInfo {
    /// Generated unique name, used as the proxy backend name
    pub name: String,
    /// Store key of the owning service (`<namespace>.<name>`)
    pub service_key: String,
    pub protocol: Protocol,
    pub service_port: u16,
    pub vhost: String,
    pub path: String,
    pub balance: String,
    pub backends: Vec<BackendServer>,
}

/// TCP or UDP entry, unique per service port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer4ServiceInfo {
    pub name: String,
    pub service_key: String,
    pub protocol: Protocol,
    pub service_port: u16,
    pub balance: String,
    pub backends: Vec<BackendServer>,
}

/// The full normalized view handed to conflict detection and config managers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub http: Vec<HttpServiceInfo>,
    pub https: Vec<HttpServiceInfo>,
    pub tcp: Vec<Layer4ServiceInfo>,
    pub udp: Vec<Layer4ServiceInfo>,
}

impl ServiceSnapshot {
    /// Build the snapshot from raw records, keeping only services of `group`
    pub fn from_services<'a>(
        services: impl IntoIterator<Item = &'a ExportedService>,
        group: &str,
    ) -> Self {
        let mut snapshot = ServiceSnapshot::default();
        for service in services {
            if !service.in_group(group) {
                debug!(
                    service = %service.key(),
                    group = %group,
                    "Service not exported to this group, skipping"
                );
                continue;
            }
            snapshot.add_service(service);
        }
        snapshot.disambiguate_names();
        snapshot.sort();
        snapshot
    }

    fn add_service(&mut self, service: &ExportedService) {
        let balance = if service.balance.is_empty() {
            DEFAULT_BALANCE.to_string()
        } else {
            service.balance.clone()
        };

        let mut layer7: BTreeMap<(Protocol, u16, String, String), Vec<&ExportPort>> =
            BTreeMap::new();
        let mut layer4: BTreeMap<(Protocol, u16), Vec<&ExportPort>> = BTreeMap::new();

        for port in &service.ports {
            let Some(protocol) = Protocol::parse(&port.protocol) else {
                debug!(service = %service.key(), protocol = %port.protocol, "Unknown protocol, dropping port");
                continue;
            };
            if port.service_port == 0 || port.backends.is_empty() {
                debug!(
                    service = %service.key(),
                    port = port.service_port,
                    "Port without service port or backends, dropping"
                );
                continue;
            }
            if protocol.is_layer7() {
                let path = normalize_path(&port.path);
                layer7
                    .entry((protocol, port.service_port, port.vhost.clone(), path))
                    .or_default()
                    .push(port);
            } else {
                layer4
                    .entry((protocol, port.service_port))
                    .or_default()
                    .push(port);
            }
        }

        for ((protocol, service_port, vhost, path), ports) in layer7 {
            let info = HttpServiceInfo {
                name: layer7_name(service, service_port, &vhost, &path),
                service_key: service.key(),
                protocol,
                service_port,
                vhost,
                path,
                balance: balance.clone(),
                backends: weighted_backends(&ports, &service.weights),
            };
            match protocol {
                Protocol::Https => self.https.push(info),
                _ => self.http.push(info),
            }
        }

        for ((protocol, service_port), ports) in layer4 {
            let info = Layer4ServiceInfo {
                name: layer4_name(service, service_port),
                service_key: service.key(),
                protocol,
                service_port,
                balance: balance.clone(),
                backends: weighted_backends(&ports, &service.weights),
            };
            match protocol {
                Protocol::Udp => self.udp.push(info),
                _ => self.tcp.push(info),
            }
        }
    }

    /// Give entries whose sanitized names collide a suffix derived from
    /// their raw identity; names are proxy backend names and must be unique
    fn disambiguate_names(&mut self) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let names = self
            .http
            .iter()
            .chain(self.https.iter())
            .map(|s| &s.name)
            .chain(self.tcp.iter().chain(self.udp.iter()).map(|s| &s.name));
        for name in names {
            *counts.entry(name.clone()).or_default() += 1;
        }
        let shared = |name: &str| counts.get(name).copied().unwrap_or(0) > 1;

        for svc in self.http.iter_mut().chain(self.https.iter_mut()) {
            if shared(&svc.name) {
                let suffix = identity_hash(&[
                    &svc.service_key,
                    &svc.protocol.to_string(),
                    &svc.service_port.to_string(),
                    &svc.vhost,
                    &svc.path,
                ]);
                debug!(name = %svc.name, suffix = %suffix, "Generated name collides, adding suffix");
                svc.name = format!("{}_{}", svc.name, suffix);
            }
        }
        for svc in self.tcp.iter_mut().chain(self.udp.iter_mut()) {
            if shared(&svc.name) {
                let suffix = identity_hash(&[
                    &svc.service_key,
                    &svc.protocol.to_string(),
                    &svc.service_port.to_string(),
                ]);
                debug!(name = %svc.name, suffix = %suffix, "Generated name collides, adding suffix");
                svc.name = format!("{}_{}", svc.name, suffix);
            }
        }
    }

    /// Deterministic order (by name, then port) for stable diffing
    fn sort(&mut self) {
        let http_key = |s: &HttpServiceInfo| (s.name.clone(), s.service_port);
        let l4_key = |s: &Layer4ServiceInfo| (s.name.clone(), s.service_port);
        self.http.sort_by_key(http_key);
        self.https.sort_by_key(http_key);
        self.tcp.sort_by_key(l4_key);
        self.udp.sort_by_key(l4_key);
    }

    /// Total number of entries across all protocols
    pub fn len(&self) -> usize {
        self.http.len() + self.https.len() + self.tcp.len() + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First 8 hex digits of the SHA-256 of the newline-joined parts
fn identity_hash(parts: &[&str]) -> String {
    let digest = Sha256::digest(parts.join("\n").as_bytes());
    hex::encode(&digest[..4])
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

fn layer4_name(service: &ExportedService, port: u16) -> String {
    format!(
        "{}_{}_{}",
        sanitize(&service.namespace),
        sanitize(&service.name),
        port
    )
}

fn layer7_name(service: &ExportedService, port: u16, vhost: &str, path: &str) -> String {
    let base = layer4_name(service, port);
    let route = sanitize(&format!("{}{}", vhost, path));
    if route.is_empty() {
        base
    } else {
        format!("{}_{}", base, route)
    }
}

/// Merge backends of the given ports, sort by address and derive weights
///
/// A label's raw weight is split across the backends sharing that label:
/// every backend gets `weight / count`, the first `weight % count` get one
/// more, and a positive weight never rounds a backend down to zero. Labels
/// absent from the table weigh 1.
pub fn weighted_backends(ports: &[&ExportPort], weights: &HashMap<String, u32>) -> Vec<BackendServer> {
    let mut backends: Vec<BackendServer> = ports
        .iter()
        .flat_map(|port| port.backends.iter())
        .map(|b| BackendServer {
            ip: b.target_ip.clone(),
            port: b.target_port,
            label: b.label.clone(),
            weight: 1,
        })
        .collect();

    backends.sort_by(|a, b| {
        sort_key_ip(&a.ip)
            .cmp(&sort_key_ip(&b.ip))
            .then(a.port.cmp(&b.port))
    });
    backends.dedup_by(|a, b| a.ip == b.ip && a.port == b.port);

    let mut per_label: HashMap<&str, u32> = HashMap::new();
    for backend in &backends {
        *per_label.entry(backend.label.as_str()).or_default() += 1;
    }

    let mut assigned: HashMap<String, u32> = HashMap::new();
    let shares: Vec<u32> = backends
        .iter()
        .map(|backend| {
            let Some(&total) = weights.get(&backend.label) else {
                return 1;
            };
            let count = per_label.get(backend.label.as_str()).copied().unwrap_or(1).max(1);
            let index = assigned.entry(backend.label.clone()).or_default();
            let mut share = total / count;
            if *index < total % count {
                share += 1;
            }
            *index += 1;
            if total > 0 {
                share.max(1)
            } else {
                0
            }
        })
        .collect();

    for (backend, weight) in backends.iter_mut().zip(shares) {
        backend.weight = weight;
    }
    backends
}

/// Numeric ordering for IPv4 addresses, lexical fallback for anything else
fn sort_key_ip(ip: &str) -> (u8, Vec<u32>, String) {
    match ip.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => (0, v4.octets().iter().map(|o| *o as u32).collect(), String::new()),
        Ok(std::net::IpAddr::V6(v6)) => (1, v6.segments().iter().map(|s| *s as u32).collect(), String::new()),
        Err(_) => (2, Vec::new(), ip.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Backend;
    use std::collections::HashSet;

    fn backend(ip: &str, port: u16, label: &str) -> Backend {
        Backend {
            target_ip: ip.to_string(),
            target_port: port,
            label: label.to_string(),
        }
    }

    fn service(name: &str, ports: Vec<ExportPort>) -> ExportedService {
        ExportedService {
            name: name.to_string(),
            namespace: "ns".to_string(),
            balance: String::new(),
            groups: vec!["external".to_string()],
            weights: HashMap::new(),
            ports,
        }
    }

    fn port(protocol: &str, service_port: u16, vhost: &str, path: &str, backends: Vec<Backend>) -> ExportPort {
        ExportPort {
            protocol: protocol.to_string(),
            service_port,
            vhost: vhost.to_string(),
            path: path.to_string(),
            backends,
        }
    }

    #[test]
    fn test_weight_split_across_label() {
        let p = port(
            "http",
            80,
            "a.com",
            "/",
            vec![
                backend("10.0.0.3", 80, "v1"),
                backend("10.0.0.1", 80, "v1"),
                backend("10.0.0.2", 80, "v1"),
            ],
        );
        let weights = HashMap::from([("v1".to_string(), 100)]);
        let backends = weighted_backends(&[&p], &weights);

        let got: Vec<(String, u32)> = backends.iter().map(|b| (b.ip.clone(), b.weight)).collect();
        assert_eq!(
            got,
            vec![
                ("10.0.0.1".to_string(), 34),
                ("10.0.0.2".to_string(), 33),
                ("10.0.0.3".to_string(), 33),
            ]
        );
        assert!(backends.iter().map(|b| b.weight).sum::<u32>() >= 100);
    }

    #[test]
    fn test_unweighted_label_defaults_to_one() {
        let p = port(
            "tcp",
            3306,
            "",
            "",
            vec![backend("10.0.0.1", 3306, "v1"), backend("10.0.0.2", 3306, "v2")],
        );
        let weights = HashMap::from([("v1".to_string(), 10)]);
        let backends = weighted_backends(&[&p], &weights);
        assert_eq!(backends[0].weight, 10);
        assert_eq!(backends[1].weight, 1);
    }

    #[test]
    fn test_small_weight_never_rounds_to_zero() {
        let p = port(
            "tcp",
            3306,
            "",
            "",
            vec![
                backend("10.0.0.1", 1, "v1"),
                backend("10.0.0.2", 1, "v1"),
                backend("10.0.0.3", 1, "v1"),
            ],
        );
        let weights = HashMap::from([("v1".to_string(), 2)]);
        let backends = weighted_backends(&[&p], &weights);
        assert!(backends.iter().all(|b| b.weight == 1));

        let weights = HashMap::from([("v1".to_string(), 0)]);
        let backends = weighted_backends(&[&p], &weights);
        assert!(backends.iter().all(|b| b.weight == 0));
    }

    #[test]
    fn test_backends_sorted_numerically() {
        let p = port(
            "tcp",
            1,
            "",
            "",
            vec![backend("10.0.0.10", 1, ""), backend("10.0.0.9", 1, "")],
        );
        let backends = weighted_backends(&[&p], &HashMap::new());
        assert_eq!(backends[0].ip, "10.0.0.9");
        assert_eq!(backends[1].ip, "10.0.0.10");
    }

    #[test]
    fn test_snapshot_split_by_protocol() {
        let svc = service(
            "svc1",
            vec![
                port("http", 8080, "x.com", "", vec![backend("10.0.0.1", 80, "")]),
                port("https", 443, "x.com", "/api", vec![backend("10.0.0.1", 443, "")]),
                port("tcp", 3306, "", "", vec![backend("10.0.0.2", 3306, "")]),
                port("udp", 53, "", "", vec![backend("10.0.0.3", 53, "")]),
                port("sctp", 99, "", "", vec![backend("10.0.0.3", 99, "")]),
                port("tcp", 0, "", "", vec![backend("10.0.0.3", 1, "")]),
                port("tcp", 9000, "", "", vec![]),
            ],
        );

        let snapshot = ServiceSnapshot::from_services([&svc], "external");
        assert_eq!(snapshot.http.len(), 1);
        assert_eq!(snapshot.https.len(), 1);
        assert_eq!(snapshot.tcp.len(), 1);
        assert_eq!(snapshot.udp.len(), 1);

        let http = &snapshot.http[0];
        assert_eq!(http.path, "/");
        assert_eq!(http.balance, DEFAULT_BALANCE);
        assert_eq!(http.name, "ns_svc1_8080_x_com");
        assert_eq!(http.service_key, "ns.svc1");
        assert_eq!(snapshot.tcp[0].name, "ns_svc1_3306");
    }

    #[test]
    fn test_ports_sharing_service_port_are_merged() {
        let svc = service(
            "svc1",
            vec![
                port("tcp", 3306, "", "", vec![backend("10.0.0.1", 3306, "")]),
                port("tcp", 3306, "", "", vec![backend("10.0.0.2", 3306, "")]),
            ],
        );
        let snapshot = ServiceSnapshot::from_services([&svc], "");
        assert_eq!(snapshot.tcp.len(), 1);
        assert_eq!(snapshot.tcp[0].backends.len(), 2);
    }

    #[test]
    fn test_group_mismatch_is_skipped() {
        let svc = service(
            "svc1",
            vec![port("tcp", 3306, "", "", vec![backend("10.0.0.1", 3306, "")])],
        );
        let snapshot = ServiceSnapshot::from_services([&svc], "internal");
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let b = service("b", vec![port("tcp", 2, "", "", vec![backend("10.0.0.1", 1, "")])]);
        let a = service("a", vec![port("tcp", 1, "", "", vec![backend("10.0.0.1", 1, "")])]);
        let snapshot = ServiceSnapshot::from_services([&b, &a], "");
        let names: Vec<&str> = snapshot.tcp.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ns_a_1", "ns_b_2"]);
    }

    #[test]
    fn test_routes_differing_in_punctuation_get_distinct_names() {
        let svc = service(
            "svc",
            vec![
                port("http", 80, "x.com", "/a-b", vec![backend("10.0.0.1", 80, "")]),
                port("http", 80, "x.com", "/a.b", vec![backend("10.0.0.2", 80, "")]),
                port("http", 80, "x.com", "/c", vec![backend("10.0.0.3", 80, "")]),
            ],
        );

        let snapshot = ServiceSnapshot::from_services([&svc], "external");
        assert_eq!(snapshot.http.len(), 3);

        let names: HashSet<&str> = snapshot.http.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains("ns_svc_80_x_com_c"));
        let suffixed: Vec<&&str> = names
            .iter()
            .filter(|n| n.starts_with("ns_svc_80_x_com_a_b_"))
            .collect();
        assert_eq!(suffixed.len(), 2);

        // Stable across rebuilds so the diff engine sees the same backends
        let again = ServiceSnapshot::from_services([&svc], "external");
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_namespace_and_name_ambiguity_is_resolved() {
        let mut first = service("c", vec![port("tcp", 3306, "", "", vec![backend("10.0.0.1", 3306, "")])]);
        first.namespace = "a-b".to_string();
        let mut second = service("b-c", vec![port("tcp", 3306, "", "", vec![backend("10.0.0.2", 3306, "")])]);
        second.namespace = "a".to_string();

        let snapshot = ServiceSnapshot::from_services([&first, &second], "external");
        assert_eq!(snapshot.tcp.len(), 2);
        assert_ne!(snapshot.tcp[0].name, snapshot.tcp[1].name);
        assert!(snapshot.tcp.iter().all(|s| s.name.starts_with("a_b_c_3306_")));
    }
}
