//! Task model and its pure state transitions.
//!
//! All persistence goes through [`TaskStore`](super::store::TaskStore); the
//! methods here only mutate the in-memory record and compute retry math.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Backoff ceiling for a single retry delay.
pub const MAX_BACKOFF_SECONDS: i64 = 86_400;

/// Priorities above this value are polled by the high-priority tier.
pub const HIGH_PRIORITY_THRESHOLD: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal states are never scheduled again (short of an operator action).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLettered)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_lettered" => Ok(TaskStatus::DeadLettered),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A deferred callback delivery.
///
/// The payload is opaque bytes and is POSTed verbatim to `callback_url` once
/// `scheduled_at` has passed.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub name: String,
    pub payload: Vec<u8>,
    pub callback_url: String,

    #[builder(default)]
    pub status: TaskStatus,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub scheduled_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default = 5)]
    pub max_retries: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 60)]
    pub retry_backoff_seconds: i64,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[builder(default = 0)]
    pub callback_attempts: i32,
    #[builder(default = 30)]
    pub callback_timeout_seconds: i32,
    #[builder(default, setter(strip_option))]
    pub last_callback_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_callback_status: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub last_callback_error: Option<String>,

    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default)]
    pub tags: Vec<String>,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    #[builder(default, setter(strip_option))]
    pub deleted_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub deleted_by: Option<String>,
}

impl Task {
    /// Transition into `processing` under the given executor.
    ///
    /// `started_at` is only set on the first entry into processing so that
    /// retried tasks keep their original start time.
    pub fn mark_processing(&mut self, worker_id: &str) {
        self.status = TaskStatus::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.worker_id = Some(worker_id.to_string());
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    /// Transition into the terminal `completed` state.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.next_retry_at = None;
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt: bumps the retry counter and schedules the
    /// next attempt with exponential backoff.
    ///
    /// Callers must check [`can_retry`](Self::can_retry) afterwards and
    /// dead-letter the task in the same persisted update when the budget is
    /// exhausted.
    pub fn mark_failed(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.retry_count += 1;
        self.error_message = Some(error.to_string());
        self.next_retry_at = Some(self.compute_next_retry());
        self.updated_at = Utc::now();
    }

    /// Transition into the terminal `dead_lettered` state.
    pub fn mark_dead_lettered(&mut self) {
        self.status = TaskStatus::DeadLettered;
        self.completed_at = Some(Utc::now());
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    /// Next retry instant: exponential backoff with ±25% jitter.
    ///
    /// The base delay is `retry_backoff_seconds << retry_count`, capped at
    /// [`MAX_BACKOFF_SECONDS`].
    pub fn compute_next_retry(&self) -> DateTime<Utc> {
        let base = self
            .retry_backoff_seconds
            .checked_shl(self.retry_count.max(0) as u32)
            .unwrap_or(MAX_BACKOFF_SECONDS)
            .clamp(1, MAX_BACKOFF_SECONDS);
        let jitter = (fastrand::f64() - 0.5) * 0.5 * base as f64;
        let delay = (base as f64 + jitter).max(0.0) as i64;
        Utc::now() + Duration::seconds(delay)
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Due now (with one second of slack for clock skew between the caller
    /// and the store).
    pub fn should_execute_now(&self) -> bool {
        self.scheduled_at <= Utc::now() + Duration::seconds(1)
    }

    pub fn can_be_deleted(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Failed)
            && self.deleted_at.is_none()
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority > HIGH_PRIORITY_THRESHOLD
    }
}
