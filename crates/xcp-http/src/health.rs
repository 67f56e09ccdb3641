//! Health check endpoints, Kubernetes-probe flavored.
//!
//! Three probes share one [`HealthManager`]: liveness (process alive),
//! readiness (accepting traffic), and startup (initialization complete).
//! `xcp-cli` flips the manager to `Ready` only after the instance store's
//! initial poll and the template context's initial load both succeed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Initializing,
    Ready,
    ShuttingDown,
    Failed,
}

impl ServiceStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ServiceStatus::Ready)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self, ServiceStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct HealthManager {
    status: Arc<RwLock<ServiceStatus>>,
    start_time: Instant,
    init_deadline: Option<Instant>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self { status: Arc::new(RwLock::new(ServiceStatus::Initializing)), start_time: Instant::now(), init_deadline: None }
    }

    pub fn with_init_timeout(timeout: Duration) -> Self {
        Self {
            status: Arc::new(RwLock::new(ServiceStatus::Initializing)),
            start_time: Instant::now(),
            init_deadline: Some(Instant::now() + timeout),
        }
    }

    pub async fn set_ready(&self) {
        *self.status.write().await = ServiceStatus::Ready;
        info!("service marked as ready");
    }

    pub async fn set_failed(&self, reason: &str) {
        *self.status.write().await = ServiceStatus::Failed;
        warn!(reason, "service marked as failed");
    }

    pub async fn set_shutting_down(&self) {
        *self.status.write().await = ServiceStatus::ShuttingDown;
        info!("service marked as shutting down");
    }

    pub async fn get_status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn is_init_timeout(&self) -> bool {
        self.init_deadline.is_some_and(|deadline| Instant::now() > deadline)
    }
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
}

fn response_for(status: &str, uptime: u64) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: uptime,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

async fn liveness_probe(State(health): State<Arc<HealthManager>>) -> Result<Json<HealthResponse>, StatusCode> {
    let status = health.get_status().await;
    if status.is_alive() {
        Ok(Json(response_for("alive", health.uptime_seconds())))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn readiness_probe(
    State(health): State<Arc<HealthManager>>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let status = health.get_status().await;
    let uptime = health.uptime_seconds();
    if status.is_ready() {
        Ok(Json(response_for("ready", uptime)))
    } else {
        let label = if status == ServiceStatus::Initializing && health.is_init_timeout() {
            "initialization_timeout"
        } else {
            "not_ready"
        };
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response_for(label, uptime))))
    }
}

async fn startup_probe(State(health): State<Arc<HealthManager>>) -> Result<Json<HealthResponse>, StatusCode> {
    match health.get_status().await {
        ServiceStatus::Ready | ServiceStatus::ShuttingDown => Ok(Json(response_for("startup_complete", health.uptime_seconds()))),
        ServiceStatus::Failed => Err(StatusCode::SERVICE_UNAVAILABLE),
        ServiceStatus::Initializing => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

pub fn health_router(health_manager: Arc<HealthManager>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/health/startup", get(startup_probe))
        .with_state(health_manager)
}
