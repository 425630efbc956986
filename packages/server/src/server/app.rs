//! Application setup: router, shared state, middleware.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::Engine;
use crate::server::routes::{
    create_task_handler, delete_task_handler, get_task_handler, health_handler,
    list_tasks_handler, resurrect_task_handler, retry_task_handler, stats_handler,
    task_events_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn build_app(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/tasks", post(create_task_handler).get(list_tasks_handler))
        .route("/tasks/stats", get(stats_handler))
        .route("/tasks/events", get(task_events_handler))
        .route("/tasks/:id", get(get_task_handler).delete(delete_task_handler))
        .route("/tasks/:id/retry", post(retry_task_handler))
        .route("/tasks/:id/resurrect", post(resurrect_task_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}
