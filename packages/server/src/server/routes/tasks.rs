//! Task CRUD and operator actions.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::pagination::PageArgs;
use crate::kernel::engine::NewTask;
use crate::kernel::tasks::{ListFilter, SortBy, SortOrder, Task, TaskError, TaskStatus};
use crate::server::app::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    /// Arbitrary JSON; stored and delivered as the exact serialized bytes.
    pub payload: serde_json::Value,
    pub callback_url: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub callback_timeout_seconds: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub callback_url: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub callback_attempts: i32,
    pub callback_timeout_seconds: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_callback_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_callback_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_callback_error: Option<String>,
    pub priority: i32,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        // Payloads are opaque bytes internally; surface them as the JSON the
        // submitter sent, falling back to a string for non-JSON bytes.
        let payload = serde_json::from_slice(&task.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&task.payload).into_owned())
        });
        Self {
            id: task.id,
            name: task.name,
            payload,
            callback_url: task.callback_url,
            status: task.status,
            created_at: task.created_at,
            scheduled_at: task.scheduled_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            max_retries: task.max_retries,
            retry_count: task.retry_count,
            next_retry_at: task.next_retry_at,
            callback_attempts: task.callback_attempts,
            callback_timeout_seconds: task.callback_timeout_seconds,
            last_callback_at: task.last_callback_at,
            last_callback_status: task.last_callback_status,
            last_callback_error: task.last_callback_error,
            priority: task.priority,
            tags: task.tags,
            error_message: task.error_message,
            worker_id: task.worker_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
    /// Minimum priority.
    pub priority: Option<i32>,
    /// Comma-separated; matches tasks carrying any of them.
    pub tags: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

pub async fn create_task_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|err| TaskError::Validation(format!("invalid payload: {}", err)))?;
    let new = NewTask {
        name: request.name,
        payload,
        callback_url: request.callback_url,
        scheduled_at: request.scheduled_at,
        priority: request.priority,
        max_retries: request.max_retries,
        callback_timeout_seconds: request.callback_timeout_seconds,
        tags: request.tags,
    };
    let task = state.engine.create_task(new).await?;
    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

pub async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let page = PageArgs::validate(query.page, query.limit).map_err(TaskError::Validation)?;
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<TaskStatus>().map_err(TaskError::Validation))
        .transpose()?;
    let tags = query
        .tags
        .map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let filter = ListFilter {
        status,
        min_priority: query.priority,
        tags,
        created_from: query.date_from,
        created_to: query.date_to,
        sort_by: SortBy::parse(query.sort_by.as_deref()),
        sort_order: SortOrder::parse(query.sort_order.as_deref()),
        page,
    };

    let (tasks, total) = state.engine.list_tasks(filter).await?;
    Ok(Json(ListResponse {
        tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        total,
        page: page.page,
        limit: page.limit,
    }))
}

pub async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state.engine.get_task(id).await?;
    Ok(Json(task.into()))
}

pub async fn delete_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let actor = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    state.engine.delete_task(id, actor.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let task = state.engine.retry_task(id).await?;
    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

pub async fn resurrect_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let task = state.engine.resurrect_task(id).await?;
    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<crate::kernel::engine::TaskStats>, ApiError> {
    let stats = state.engine.stats().await?;
    Ok(Json(stats))
}
