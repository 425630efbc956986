//! Health endpoint.
//!
//! 200 while the engine is healthy or deliberately stopped, 503 when a
//! dependency is down.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::kernel::engine::{EngineHealth, HealthStatus};
use crate::server::app::AppState;

pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<EngineHealth>) {
    let health = state.engine.health().await;
    let status = match health.status {
        HealthStatus::Healthy | HealthStatus::Stopped => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health))
}
