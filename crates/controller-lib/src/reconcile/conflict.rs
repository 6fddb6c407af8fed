//! Listening address conflict detection
//!
//! Every externally reachable (host, port, path) or port must map to exactly
//! one service entry. Layer-7 entries share one (host, port, path) space;
//! all entries share one port space, in which HTTP, HTTPS and layer-4 uses
//! of a port exclude each other. Entries are registered HTTP, HTTPS, TCP,
//! UDP and the first collision is reported.

use crate::error::ConflictError;
use crate::models::Protocol;
use crate::service::ServiceSnapshot;
use std::collections::HashMap;

struct PortOwner<'a> {
    protocol: Protocol,
    name: &'a str,
}

#[derive(Default)]
struct Registry<'a> {
    routes: HashMap<(&'a str, u16, &'a str), &'a str>,
    ports: HashMap<u16, PortOwner<'a>>,
}

impl<'a> Registry<'a> {
    fn claim_route(&mut self, vhost: &'a str, port: u16, path: &'a str, name: &'a str) -> Result<(), ConflictError> {
        if let Some(first) = self.routes.get(&(vhost, port, path)) {
            return Err(ConflictError {
                address: format!("{}:{}{}", vhost, port, path),
                first: first.to_string(),
                second: name.to_string(),
            });
        }
        self.routes.insert((vhost, port, path), name);
        Ok(())
    }

    fn claim_port(&mut self, protocol: Protocol, port: u16, name: &'a str) -> Result<(), ConflictError> {
        if let Some(owner) = self.ports.get(&port) {
            // Layer-7 entries of one protocol share a port by host and path
            let shared = owner.protocol == protocol && protocol.is_layer7();
            if !shared {
                return Err(ConflictError {
                    address: format!("{}:{}", protocol, port),
                    first: owner.name.to_string(),
                    second: name.to_string(),
                });
            }
            return Ok(());
        }
        self.ports.insert(port, PortOwner { protocol, name });
        Ok(())
    }
}

/// Check a snapshot for entries claiming the same address
pub fn detect_conflicts(snapshot: &ServiceSnapshot) -> Result<(), ConflictError> {
    let mut registry = Registry::default();

    for svc in snapshot.http.iter().chain(snapshot.https.iter()) {
        registry.claim_route(&svc.vhost, svc.service_port, &svc.path, &svc.name)?;
        registry.claim_port(svc.protocol, svc.service_port, &svc.name)?;
    }
    for svc in snapshot.tcp.iter().chain(snapshot.udp.iter()) {
        registry.claim_port(svc.protocol, svc.service_port, &svc.name)?;
    }
    Ok(())
}
