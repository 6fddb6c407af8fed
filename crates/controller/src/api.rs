//! HTTP API for health checks, Prometheus metrics and the service snapshot

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use controller_lib::{
    health::{ComponentStatus, HealthRegistry},
    ServiceLister,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub lister: Arc<dyn ServiceLister>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, lister: Arc<dyn ServiceLister>) -> Self {
        Self {
            health_registry,
            lister,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Last good config still serving
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once a configuration is applied
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Normalized services as the next reconciliation pass would see them
async fn services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.lister.list())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/services", get(services))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use controller_lib::health::components;
    use controller_lib::{decode_service, ControllerMetrics, ServiceSnapshot};
    use tower::ServiceExt;

    struct FixedLister(ServiceSnapshot);

    impl ServiceLister for FixedLister {
        fn list(&self) -> ServiceSnapshot {
            self.0.clone()
        }
    }

    fn state(health: HealthRegistry) -> Arc<AppState> {
        let payload = br#"{
            "serviceName": "svc1",
            "namespace": "ns",
            "servicePort": [{
                "protocol": "tcp",
                "servicePort": 3306,
                "backends": [{"targetIP": "10.0.0.7", "targetPort": 3306}]
            }]
        }"#;
        let service = decode_service(payload).unwrap();
        let snapshot = ServiceSnapshot::from_services([&service], "");
        Arc::new(AppState::new(health, Arc::new(FixedLister(snapshot))))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_degraded_is_still_ok() {
        let health = HealthRegistry::new();
        health.register(components::PROXY).await;
        health.set_degraded(components::PROXY, "conflict").await;

        let (status, body) = get(create_router(state(health)), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"degraded\""));
    }

    #[tokio::test]
    async fn test_healthz_unhealthy() {
        let health = HealthRegistry::new();
        health.set_unhealthy(components::REFLECTOR, "store unreachable").await;

        let (status, _) = get(create_router(state(health)), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_follows_first_apply() {
        let health = HealthRegistry::new();
        let app = create_router(state(health.clone()));

        let (status, body) = get(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("No proxy configuration applied yet"));

        health.set_ready(true).await;
        let (status, _) = get(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        ControllerMetrics::new().inc_conflicts();

        let (status, body) = get(create_router(state(HealthRegistry::new())), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("lb_controller_config_conflicts_total"));
    }

    #[tokio::test]
    async fn test_services_snapshot() {
        let (status, body) = get(create_router(state(HealthRegistry::new())), "/services").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["tcp"][0]["name"], "ns_svc1_3306");
        assert_eq!(json["tcp"][0]["backends"][0]["ip"], "10.0.0.7");
        assert!(json["http"].as_array().unwrap().is_empty());
    }
}
