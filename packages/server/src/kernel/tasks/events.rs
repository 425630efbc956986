//! Task lifecycle events.
//!
//! Facts about what happened to a task, broadcast through the
//! [`StreamHub`](crate::kernel::stream_hub::StreamHub) for SSE consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was accepted and stored.
    Created {
        task_id: Uuid,
        name: String,
        priority: i32,
        scheduled_at: DateTime<Utc>,
    },

    /// A worker picked the task up.
    Started {
        task_id: Uuid,
        worker_id: String,
        attempt: i32,
    },

    /// The callback was delivered.
    Completed {
        task_id: Uuid,
        callback_status: Option<i32>,
        duration_ms: i64,
    },

    /// An attempt failed; a retry is scheduled.
    Failed {
        task_id: Uuid,
        error: String,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
    },

    /// Retry budget exhausted or the endpoint rejected permanently.
    DeadLettered {
        task_id: Uuid,
        error: Option<String>,
        total_attempts: i32,
    },

    /// Operator reset a failed task back to pending.
    Retried { task_id: Uuid },

    /// Operator returned a dead-lettered task to pending.
    Resurrected { task_id: Uuid },

    /// Task was soft-deleted.
    Deleted {
        task_id: Uuid,
        deleted_by: Option<String>,
    },
}

impl TaskEvent {
    /// Wire name, also used as the SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "created",
            TaskEvent::Started { .. } => "started",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
            TaskEvent::DeadLettered { .. } => "dead_lettered",
            TaskEvent::Retried { .. } => "retried",
            TaskEvent::Resurrected { .. } => "resurrected",
            TaskEvent::Deleted { .. } => "deleted",
        }
    }
}
