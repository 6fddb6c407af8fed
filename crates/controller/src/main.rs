//! Load balancer controller
//!
//! Runs beside an HAProxy or NGINX instance, mirrors the exported services
//! of the coordination store and keeps the proxy configuration in step.

use anyhow::{Context, Result};
use controller_lib::{
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    proxy::{ConfigManager, HaproxyManager, NginxManager, ProxyKind},
    store::FsStore,
    ChangeNotifier, EventProcessor, Reflector, ServiceLister, Shutdown,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting lb-controller");

    let config = config::ControllerConfig::load()?;
    info!(
        instance = %config.instance,
        proxy = %config.proxy.kind,
        store = %config.store.base_dir.display(),
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::REFLECTOR).await;
    health_registry.register(components::EVENT_PROCESSOR).await;
    health_registry.register(components::PROXY).await;

    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(
        CONTROLLER_VERSION,
        &config.proxy.kind.to_string(),
        &config.reflector.group,
    );

    let store = FsStore::open(&config.store.base_dir).with_context(|| {
        format!("failed to open store at {}", config.store.base_dir.display())
    })?;

    let manager: Arc<dyn ConfigManager> = match config.proxy.kind {
        ProxyKind::Haproxy => Arc::new(HaproxyManager::new(config.proxy.haproxy_config())),
        ProxyKind::Nginx => Arc::new(NginxManager::new(config.proxy.nginx_config())),
    };

    let shutdown = Shutdown::new();
    let notifier = Arc::new(ChangeNotifier::new());
    let reflector = Reflector::new(
        Arc::new(store),
        config.reflector.to_config(),
        notifier.clone(),
        shutdown.clone(),
        health_registry.clone(),
    );
    let lister: Arc<dyn ServiceLister> = Arc::new(reflector.lister());

    let processor = Arc::new(EventProcessor::new(
        config.processor.to_config(),
        lister.clone(),
        manager,
        notifier,
        health_registry.clone(),
    ));

    reflector.start();
    let processor_handle = tokio::spawn(processor.run(shutdown.subscribe()));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), lister));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {e}"),
                Err(e) => format!("API server task failed: {e}"),
            };
            error!(reason = %reason, "Shutting down");
            logger.log_shutdown(&reason);
        }
    }

    info!("Shutting down");
    shutdown.trigger();
    reflector.stop().await;
    if let Err(e) = processor_handle.await {
        error!(error = %e, "Event processor task failed");
    }

    Ok(())
}
