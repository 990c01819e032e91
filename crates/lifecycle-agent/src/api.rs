//! HTTP API for health checks, Prometheus metrics and lifecycle reports

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lifecycle_lib::{
    health::{ComponentStatus, HealthRegistry},
    observability::LifecycleMetrics,
    schedule::{ReportStore, RunRequest, RunTrigger, TriggerError},
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: LifecycleMetrics,
    pub reports: ReportStore,
    pub trigger: RunTrigger,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: LifecycleMetrics,
        reports: ReportStore,
        trigger: RunTrigger,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            reports,
            trigger,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// 200 while operational, 503 once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Report of the last completed run
async fn latest_report(State(state): State<Arc<AppState>>) -> Response {
    match state.reports.latest().await {
        Some(report) => Json(report).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No lifecycle run has completed yet"),
    }
}

/// Run now and return the report; `?dry_run=` overrides the configured mode
async fn trigger_run(
    State(state): State<Arc<AppState>>,
    Query(request): Query<RunRequest>,
) -> Response {
    match state.trigger.run(request).await {
        Ok(report) => Json(report).into_response(),
        Err(TriggerError::Closed) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, TriggerError::Closed.to_string())
        }
        Err(e @ TriggerError::Failed(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/report", get(latest_report))
        .route("/api/v1/runs", post(trigger_run))
        .with_state(state)
}

/// Start the API server, stopping on the shutdown signal
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
