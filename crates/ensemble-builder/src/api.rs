//! HTTP API for health checks and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ensemble_lib::health::{ComponentStatus, HealthRegistry};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry) -> Self {
        Self { health_registry }
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational, e.g. waiting for data
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
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

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
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
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ensemble_lib::{
        BuilderPhase, Component, EnsembleMetrics, HealthResponse, ReadinessResponse,
    };
    use tower::ServiceExt;

    async fn setup_test_app() -> (Router, HealthRegistry) {
        let health_registry = HealthRegistry::new();
        let router = create_router(Arc::new(AppState::new(health_registry.clone())));
        (router, health_registry)
    }

    async fn get_path(router: Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz_healthy() {
        let (router, _) = setup_test_app().await;
        let (status, body) = get_path(router, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.phase, BuilderPhase::Starting);
        assert!(health.component(Component::Store).is_some());
    }

    #[tokio::test]
    async fn test_healthz_degraded_while_starving() {
        let (router, registry) = setup_test_app().await;
        registry
            .set_degraded(Component::Store, "Waiting for ensemble targets or predictions")
            .await;

        let (status, body) = get_path(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_healthz_unhealthy_after_memory_floor() {
        let (router, registry) = setup_test_app().await;
        registry
            .set_unhealthy(Component::Governor, "Memory limit exceeded with a single candidate")
            .await;

        let (status, _) = get_path(router, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz() {
        let (router, registry) = setup_test_app().await;
        let (status, body) = get_path(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let readiness: ReadinessResponse = serde_json::from_slice(&body).unwrap();
        assert!(!readiness.ready);

        registry
            .set_phase(BuilderPhase::Running {
                n_best: 50,
                restarts: 0,
            })
            .await;
        let (status, _) = get_path(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        registry
            .set_phase(BuilderPhase::Stopped {
                reason: "memory_floor".to_string(),
                failed: true,
            })
            .await;
        let (status, body) = get_path(router, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let readiness: ReadinessResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(readiness.reason.as_deref(), Some("Builder stopped: memory_floor"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = EnsembleMetrics::new();
        metrics.inc_ensembles_fitted();

        let (router, _) = setup_test_app().await;
        let (status, body) = get_path(router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("ensemble_builder_ensembles_fitted_total"));
    }
}
