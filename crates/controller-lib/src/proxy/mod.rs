//! Proxy configuration managers
//!
//! A [`ConfigManager`] owns everything proxy specific: the structural model,
//! rendering, the config file on disk, validation, reload and (for HAProxy)
//! live patching over the runtime API. The reconciliation pass drives it
//! through the apply protocol:
//!
//! 1. `try_update_without_reload`, done if no reload is needed
//! 2. `create` a candidate file
//! 3. `check_difference` against the active file
//! 4. `validate` the candidate
//! 5. `replace` the active file (with backup)
//! 6. `reload` the proxy

pub mod files;
pub mod haproxy;
pub mod nginx;
pub mod process;
pub mod runtime;

pub use files::{compute_checksum, ConfigFiles, FileLayout, RenderedConfig};
pub use haproxy::{HaproxyConfig, HaproxyManager};
pub use nginx::{NginxConfig, NginxManager};
pub use process::{HaproxyBinary, NginxBinary, ProxyProcess};
pub use runtime::{RuntimeApi, UnixSocketRuntime};

use crate::error::ProxyError;
use crate::service::ServiceSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported proxy engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Haproxy,
    Nginx,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Haproxy => write!(f, "haproxy"),
            ProxyKind::Nginx => write!(f, "nginx"),
        }
    }
}

#[async_trait]
pub trait ConfigManager: Send + Sync {
    fn kind(&self) -> ProxyKind;

    /// Reconcile the running proxy without touching the config file
    ///
    /// Returns true when a full reload is needed. Failures are reported as
    /// "reload needed", never as errors.
    async fn try_update_without_reload(&self, services: &ServiceSnapshot) -> bool;

    /// Render a candidate configuration file for `services`
    async fn create(&self, services: &ServiceSnapshot) -> Result<RenderedConfig, ProxyError>;

    /// Whether the candidate differs from the active file
    async fn check_difference(&self, candidate: &RenderedConfig) -> Result<bool, ProxyError>;

    /// Run the proxy's syntax check on the candidate
    async fn validate(&self, candidate: &RenderedConfig) -> Result<(), ProxyError>;

    /// Make the candidate the active file, keeping a backup
    async fn replace(&self, candidate: &RenderedConfig) -> Result<(), ProxyError>;

    /// Reload the proxy with the active file
    async fn reload(&self) -> Result<(), ProxyError>;

    /// Whether the next pass must reload even if the file is unchanged
    /// (nothing applied yet, or the live state is unknown)
    fn requires_full_apply(&self) -> bool;
}
