//! Load balancer sidecar control plane
//!
//! This crate provides the core functionality for:
//! - Mirroring exported services from a coordination store
//! - Normalizing them into per-protocol proxy entries
//! - Detecting address conflicts before anything is applied
//! - Rendering, validating and reloading HAProxy or NGINX configuration
//! - Patching a running HAProxy over its runtime API when no reload is needed
//! - Health checks and observability

pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod proxy;
pub mod reconcile;
pub mod reflector;
pub mod service;
pub mod shutdown;
pub mod store;

pub use error::{ConflictError, DecodeError, ProxyError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use reconcile::{ChangeNotifier, EventProcessor, ProcessorConfig, ReconcileOutcome};
pub use reflector::{Reflector, ReflectorConfig, ServiceLister};
pub use service::ServiceSnapshot;
pub use shutdown::{Shutdown, ShutdownSignal};
