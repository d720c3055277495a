//! Health endpoints for container/orchestrator probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Health status of the ingestion worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub log_connected: bool,
    pub loop_healthy: bool,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            log_connected: true,
            loop_healthy: true,
        }
    }

    pub fn unhealthy(reason: &str) -> Self {
        Self {
            status: format!("unhealthy: {}", reason),
            log_connected: false,
            loop_healthy: false,
        }
    }
}

/// Shared health state, updated by the processing loop and its adapters.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
    log_connected: bool,
    loop_healthy: bool,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthStateInner {
                log_connected: true,
                loop_healthy: true,
                last_error: None,
            })),
        }
    }

    /// Mark the durable log connection up or down.
    pub async fn set_log_connected(&self, connected: bool) {
        let mut inner = self.inner.write().await;
        inner.log_connected = connected;
    }

    /// Mark the processing loop itself healthy or fatally stopped.
    pub async fn set_loop_healthy(&self, healthy: bool) {
        let mut inner = self.inner.write().await;
        inner.loop_healthy = healthy;
    }

    pub async fn set_error(&self, error: Option<String>) {
        let mut inner = self.inner.write().await;
        inner.last_error = error;
    }

    /// Liveness: only `loop_healthy` gates this. A temporary NATS or
    /// Postgres disconnection should not trigger a restart; only a fatal
    /// processing-loop exit should.
    pub async fn is_alive(&self) -> bool {
        let inner = self.inner.read().await;
        inner.loop_healthy
    }

    /// Readiness requires both the log connection and the loop itself.
    pub async fn is_healthy(&self) -> bool {
        let inner = self.inner.read().await;
        inner.log_connected && inner.loop_healthy
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        if inner.log_connected && inner.loop_healthy {
            HealthStatus::healthy()
        } else {
            let reason = inner
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            HealthStatus::unhealthy(&reason)
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Health/metrics server for container orchestrator probes.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl HealthServer {
    /// Create a new health server.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: HealthState::new(),
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for /metrics endpoint.
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Get the health state for updates.
    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let metrics_handle = self.metrics_handle.clone();

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(state);

        if let Some(handle) = metrics_handle {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
    }

    /// Run the health server.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Liveness probe handler (`/health`, `/healthz`).
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_alive().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

/// Readiness probe handler (`/ready`, `/readyz`).
async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if state.is_healthy().await {
        (StatusCode::OK, Json(state.status().await))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(state.status().await))
    }
}
