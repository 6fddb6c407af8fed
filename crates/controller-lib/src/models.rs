//! Core data models for exported services
//!
//! These mirror the JSON payload stored under each service node of the
//! coordination store. Records are replaced wholesale on every delivery.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Exposure protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    /// Parse a protocol name as written in the store payload
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }

    /// Layer-7 protocols route on virtual host and path
    pub fn is_layer7(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A service exported for load balancing, identified by (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedService {
    #[serde(rename = "serviceName")]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Load balancing algorithm (e.g. roundrobin, source, leastconn)
    #[serde(default)]
    pub balance: String,
    /// Group membership tags; only matching instances expose the service
    #[serde(rename = "bcsGroup", default)]
    pub groups: Vec<String>,
    /// Raw weight per backend label
    #[serde(rename = "serviceWeight", default)]
    pub weights: HashMap<String, u32>,
    #[serde(rename = "servicePort", default)]
    pub ports: Vec<ExportPort>,
}

impl ExportedService {
    /// Store node name for this service: `<namespace>.<name>`
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Whether the service is exported to the given instance group
    pub fn in_group(&self, group: &str) -> bool {
        group.is_empty() || self.groups.iter().any(|g| g == group)
    }
}

/// One exposed port of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPort {
    pub protocol: String,
    #[serde(rename = "servicePort", default)]
    pub service_port: u16,
    /// Virtual host, layer-7 only
    #[serde(rename = "bcsVHost", default)]
    pub vhost: String,
    /// Path prefix, layer-7 only
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

/// A concrete upstream endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(rename = "targetIP")]
    pub target_ip: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
    #[serde(default)]
    pub label: String,
}

/// Decode a store node payload
pub fn decode_service(data: &[u8]) -> Result<ExportedService, crate::error::DecodeError> {
    let service: ExportedService = serde_json::from_slice(data)?;
    if service.name.is_empty() {
        return Err(crate::error::DecodeError::MissingField("serviceName"));
    }
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "serviceName": "svc1",
        "namespace": "ns",
        "balance": "roundrobin",
        "bcsGroup": ["external"],
        "serviceWeight": {"v1": 100},
        "servicePort": [{
            "protocol": "http",
            "servicePort": 8080,
            "bcsVHost": "x.com",
            "path": "/api",
            "backends": [{"targetIP": "10.0.0.1", "targetPort": 80, "label": "v1"}]
        }]
    }"#;

    #[test]
    fn test_decode_service_payload() {
        let svc = decode_service(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(svc.key(), "ns.svc1");
        assert_eq!(svc.balance, "roundrobin");
        assert_eq!(svc.weights.get("v1"), Some(&100));
        assert_eq!(svc.ports.len(), 1);
        assert_eq!(svc.ports[0].vhost, "x.com");
        assert_eq!(svc.ports[0].backends[0].target_ip, "10.0.0.1");
        assert!(svc.in_group("external"));
        assert!(!svc.in_group("internal"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_service(b"{not json").is_err());
        assert!(decode_service(br#"{"serviceName": ""}"#).is_err());
    }

    #[test]
    fn test_empty_group_accepts_all() {
        let svc = decode_service(PAYLOAD.as_bytes()).unwrap();
        assert!(svc.in_group(""));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::parse(" udp "), Some(Protocol::Udp));
        assert_eq!(Protocol::parse("sctp"), None);
        assert!(Protocol::Https.is_layer7());
        assert!(!Protocol::Tcp.is_layer7());
    }
}
