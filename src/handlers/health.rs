use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

use crate::handlers::AppState;
use crate::message_queue::JobCounts;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

/// Individual component health details
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub database: ComponentHealth,
    /// Order-processing job counts; absent when the database is down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<JobCounts>,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn get_uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Liveness plus database ping
#[utoipa::path(
    get,
    path = "/health",
    summary = "Health check",
    responses(
        (status = 200, description = "Service and database are up", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_check_start = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let db_latency = db_check_start.elapsed().as_millis() as u64;
    let db_up = db_result.is_ok();

    let database = ComponentHealth {
        status: if db_up {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        },
        message: db_result.map_or_else(
            |e| format!("Connection failed: {}", e),
            |_| "Connection successful".to_string(),
        ),
        latency_ms: Some(db_latency),
    };

    let queue = if db_up {
        match state.services.order_queue.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read job counts");
                None
            }
        }
    } else {
        None
    };

    let status_code = if db_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: database.status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_secs: get_uptime_secs(),
            database,
            queue,
        }),
    )
}
