//! HTTP route handlers.

pub mod health;
pub mod stream;
pub mod tasks;

pub use health::health_handler;
pub use stream::task_events_handler;
pub use tasks::{
    create_task_handler, delete_task_handler, get_task_handler, list_tasks_handler,
    resurrect_task_handler, retry_task_handler, stats_handler,
};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::kernel::tasks::TaskError;

/// Wire shape for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Maps engine errors onto status codes and the error body.
pub struct ApiError(pub TaskError);

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            TaskError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            TaskError::InvalidStatus { .. } => (StatusCode::BAD_REQUEST, "invalid_status"),
            TaskError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            TaskError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            TaskError::AlreadyStarted => (StatusCode::CONFLICT, "already_started"),
            TaskError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
            TaskError::Database(_)
            | TaskError::Internal(_)
            | TaskError::StoreTimeout(_)
            | TaskError::ShutdownTimeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = ErrorBody {
            error: code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
