//! Structural diff and live patch planning
//!
//! A new model is patchable against the applied one only when:
//! - `global` and `defaults` are unchanged
//! - HTTP and HTTPS frontends match in port and name
//! - every frontend has the same backends (name, host, path, balance)
//! - no backend gains more servers than it has slots
//! - TCP listeners are identical (they are never patched live)
//!
//! Patchable changes become per-server runtime commands. Servers are matched
//! by `ip:port`; new addresses take over the slots of vanished ones in slot
//! order, and leftover slots are disabled since the runtime API cannot
//! delete a slot.

use super::model::{Frontend, HaproxyModel, RealServer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// A single runtime API command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    SetWeight {
        backend: String,
        server: String,
        weight: u32,
    },
    SetAddr {
        backend: String,
        server: String,
        ip: String,
        port: u16,
    },
    Enable {
        backend: String,
        server: String,
    },
    Disable {
        backend: String,
        server: String,
    },
}

impl fmt::Display for RuntimeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeCommand::SetWeight {
                backend,
                server,
                weight,
            } => write!(f, "set server {}/{} weight {}", backend, server, weight),
            RuntimeCommand::SetAddr {
                backend,
                server,
                ip,
                port,
            } => write!(f, "set server {}/{} addr {} port {}", backend, server, ip, port),
            RuntimeCommand::Enable { backend, server } => {
                write!(f, "enable server {}/{}", backend, server)
            }
            RuntimeCommand::Disable { backend, server } => {
                write!(f, "disable server {}/{}", backend, server)
            }
        }
    }
}

/// Commands bringing the running proxy to the new state, plus the model
/// describing that state (slot names and positions of the old model)
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub commands: Vec<RuntimeCommand>,
    pub patched: HaproxyModel,
}

impl PatchPlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Why a change cannot be applied live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralChange {
    Global,
    Defaults,
    Frontends(&'static str),
    Backends(String),
    Backend(String),
    ServerCount(String),
    TcpListeners,
}

impl fmt::Display for StructuralChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralChange::Global => write!(f, "global settings changed"),
            StructuralChange::Defaults => write!(f, "defaults changed"),
            StructuralChange::Frontends(kind) => write!(f, "{} frontend set changed", kind),
            StructuralChange::Backends(frontend) => {
                write!(f, "backend set of frontend {} changed", frontend)
            }
            StructuralChange::Backend(backend) => {
                write!(f, "host, path or balance of backend {} changed", backend)
            }
            StructuralChange::ServerCount(backend) => {
                write!(f, "backend {} needs more server slots", backend)
            }
            StructuralChange::TcpListeners => write!(f, "tcp listeners changed"),
        }
    }
}

/// Plan a live patch from `old` (applied) to `new`
pub fn plan_patch(old: &HaproxyModel, new: &HaproxyModel) -> Result<PatchPlan, StructuralChange> {
    if old.global != new.global {
        return Err(StructuralChange::Global);
    }
    if old.defaults != new.defaults {
        return Err(StructuralChange::Defaults);
    }
    if old.tcp_listeners != new.tcp_listeners {
        return Err(StructuralChange::TcpListeners);
    }

    let mut patched = old.clone();
    let mut commands = Vec::new();

    patch_frontends(
        "http",
        &old.http_frontends,
        &new.http_frontends,
        &mut patched.http_frontends,
        &mut commands,
    )?;
    patch_frontends(
        "https",
        &old.https_frontends,
        &new.https_frontends,
        &mut patched.https_frontends,
        &mut commands,
    )?;

    Ok(PatchPlan { commands, patched })
}

fn patch_frontends(
    kind: &'static str,
    old: &BTreeMap<u16, Frontend>,
    new: &BTreeMap<u16, Frontend>,
    patched: &mut BTreeMap<u16, Frontend>,
    commands: &mut Vec<RuntimeCommand>,
) -> Result<(), StructuralChange> {
    let same_frontends = old.len() == new.len()
        && old
            .iter()
            .zip(new.iter())
            .all(|((op, of), (np, nf))| op == np && of.name == nf.name);
    if !same_frontends {
        return Err(StructuralChange::Frontends(kind));
    }

    for (port, new_frontend) in new {
        let (Some(old_frontend), Some(target)) = (old.get(port), patched.get_mut(port)) else {
            return Err(StructuralChange::Frontends(kind));
        };

        let same_backends = old_frontend.backends.len() == new_frontend.backends.len()
            && old_frontend
                .backends
                .keys()
                .zip(new_frontend.backends.keys())
                .all(|(a, b)| a == b);
        if !same_backends {
            return Err(StructuralChange::Backends(new_frontend.name.clone()));
        }

        for (name, new_backend) in &new_frontend.backends {
            let (Some(old_backend), Some(slots)) =
                (old_frontend.backends.get(name), target.backends.get_mut(name))
            else {
                return Err(StructuralChange::Backends(new_frontend.name.clone()));
            };

            if old_backend.host != new_backend.host
                || old_backend.path != new_backend.path
                || old_backend.balance != new_backend.balance
            {
                return Err(StructuralChange::Backend(name.clone()));
            }
            if new_backend.servers.len() > old_backend.servers.len() {
                return Err(StructuralChange::ServerCount(name.clone()));
            }

            patch_servers(name, &mut slots.servers, &new_backend.servers, commands);
        }
    }
    Ok(())
}

/// Rewrite `slots` in place towards `wanted`, recording the commands
///
/// Requires `wanted.len() <= slots.len()`.
fn patch_servers(
    backend: &str,
    slots: &mut [RealServer],
    wanted: &[RealServer],
    commands: &mut Vec<RuntimeCommand>,
) {
    let wanted_by_addr: HashMap<(String, u16), &RealServer> =
        wanted.iter().map(|s| (s.address(), s)).collect();
    let slot_addrs: HashSet<(String, u16)> = slots.iter().map(RealServer::address).collect();

    let mut freed = Vec::new();
    for (idx, slot) in slots.iter_mut().enumerate() {
        match wanted_by_addr.get(&slot.address()) {
            Some(target) => converge(backend, slot, target.weight, commands),
            None => freed.push(idx),
        }
    }

    let added: Vec<&RealServer> = wanted
        .iter()
        .filter(|s| !slot_addrs.contains(&s.address()))
        .collect();

    for (&idx, server) in freed.iter().zip(added.iter()) {
        let slot = &mut slots[idx];
        commands.push(RuntimeCommand::SetAddr {
            backend: backend.to_string(),
            server: slot.name.clone(),
            ip: server.ip.clone(),
            port: server.port,
        });
        slot.ip = server.ip.clone();
        slot.port = server.port;
        converge(backend, slot, server.weight, commands);
    }

    for &idx in freed.iter().skip(added.len()) {
        let slot = &mut slots[idx];
        if !slot.disabled {
            commands.push(RuntimeCommand::Disable {
                backend: backend.to_string(),
                server: slot.name.clone(),
            });
            slot.disabled = true;
        }
    }
}

/// Bring an occupied slot to `weight` and make sure it is enabled
fn converge(backend: &str, slot: &mut RealServer, weight: u32, commands: &mut Vec<RuntimeCommand>) {
    if slot.weight != weight {
        commands.push(RuntimeCommand::SetWeight {
            backend: backend.to_string(),
            server: slot.name.clone(),
            weight,
        });
        slot.weight = weight;
    }
    if slot.disabled {
        commands.push(RuntimeCommand::Enable {
            backend: backend.to_string(),
            server: slot.name.clone(),
        });
        slot.disabled = false;
    }
}
