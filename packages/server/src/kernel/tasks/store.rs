//! PostgreSQL-backed task store.
//!
//! The store is the coordination point between scheduler tiers and workers:
//! claims are single-statement `FOR UPDATE SKIP LOCKED` selections feeding an
//! `UPDATE … RETURNING` that flips the row to `processing`, so no two pollers
//! can ever hand out the same row.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::common::pagination::PageArgs;

use super::error::TaskError;
use super::task::{Task, TaskStatus};

/// Soft timeout for scheduling polls.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Soft timeout for the cleanup sweep.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Rows deleted per cleanup batch; keeps each transaction short.
const CLEANUP_BATCH: i64 = 1000;
/// Terminal rows older than this are physically removed.
const RETENTION_DAYS: i32 = 30;

const TASK_COLUMNS: &str = "id, name, payload, callback_url, status, \
     created_at, updated_at, scheduled_at, started_at, completed_at, \
     max_retries, retry_count, retry_backoff_seconds, next_retry_at, \
     callback_attempts, callback_timeout_seconds, last_callback_at, \
     last_callback_status, last_callback_error, priority, tags, \
     error_message, worker_id, deleted_at, deleted_by";

fn qualified_columns(alias: &str) -> String {
    TASK_COLUMNS
        .split(", ")
        .map(|col| format!("{}.{}", alias, col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, TaskError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::StoreTimeout(limit)),
    }
}

// =============================================================================
// List filter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    CreatedAt,
    ScheduledAt,
    Priority,
}

impl SortBy {
    /// Unknown values fall back to the default sort column.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("scheduled_at") => SortBy::ScheduledAt,
            Some("priority") => SortBy::Priority,
            _ => SortBy::CreatedAt,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortBy::CreatedAt => "created_at",
            SortBy::ScheduledAt => "scheduled_at",
            SortBy::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filters for the paginated list read.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub min_priority: Option<i32>,
    /// Matches tasks carrying at least one of these tags.
    pub tags: Vec<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub page: PageArgs,
}

impl ListFilter {
    fn push_predicates(&self, qb: &mut QueryBuilder<'_, sqlx::Postgres>) {
        qb.push(" WHERE deleted_at IS NULL");
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(min_priority) = self.min_priority {
            qb.push(" AND priority >= ").push_bind(min_priority);
        }
        if !self.tags.is_empty() {
            qb.push(" AND tags && ").push_bind(self.tags.clone());
        }
        if let Some(from) = self.created_from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = self.created_to {
            qb.push(" AND created_at <= ").push_bind(to);
        }
    }
}

/// Recovery counts for stale `processing` rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Rows put back into `pending` with an incremented retry count.
    pub requeued: u64,
    /// Rows whose budget ran out and were dead-lettered.
    pub dead_lettered: u64,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new task. Fails with [`TaskError::Conflict`] when the id is
    /// already taken.
    pub async fn create(&self, task: &Task) -> Result<Task, TaskError> {
        let sql = format!(
            r#"
            INSERT INTO task_queue (
                id, name, payload, callback_url, status,
                created_at, updated_at, scheduled_at, started_at, completed_at,
                max_retries, retry_count, retry_backoff_seconds, next_retry_at,
                callback_attempts, callback_timeout_seconds, last_callback_at,
                last_callback_status, last_callback_error, priority, tags,
                error_message, worker_id, deleted_at, deleted_by
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13, $14,
                $15, $16, $17,
                $18, $19, $20, $21,
                $22, $23, $24, $25
            )
            RETURNING {TASK_COLUMNS}
            "#
        );

        let result = sqlx::query_as::<_, Task>(&sql)
            .bind(task.id)
            .bind(&task.name)
            .bind(&task.payload)
            .bind(&task.callback_url)
            .bind(task.status)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.scheduled_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.max_retries)
            .bind(task.retry_count)
            .bind(task.retry_backoff_seconds)
            .bind(task.next_retry_at)
            .bind(task.callback_attempts)
            .bind(task.callback_timeout_seconds)
            .bind(task.last_callback_at)
            .bind(task.last_callback_status)
            .bind(task.last_callback_error.as_deref())
            .bind(task.priority)
            .bind(&task.tags)
            .bind(task.error_message.as_deref())
            .bind(task.worker_id.as_deref())
            .bind(task.deleted_at)
            .bind(task.deleted_by.as_deref())
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(task) => Ok(task),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(TaskError::Conflict(task.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a live task by id; soft-deleted rows read as missing.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Task, TaskError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE id = $1 AND deleted_at IS NULL"
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TaskError::NotFound(id))
    }

    /// Atomically claim up to `limit` due pending tasks.
    ///
    /// `min_priority = -1` claims any priority; otherwise only rows with
    /// `priority > min_priority` qualify. Claimed rows are flipped to
    /// `processing` in the same statement so concurrent pollers skip them;
    /// a claim the caller cannot hand to a worker must be [`release`]d.
    ///
    /// [`release`]: Self::release
    pub async fn claim_due_tasks(
        &self,
        min_priority: i32,
        limit: i64,
        claimed_by: &str,
    ) -> Result<Vec<Task>, TaskError> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id
                FROM task_queue
                WHERE status = 'pending'
                  AND scheduled_at <= NOW()
                  AND deleted_at IS NULL
                  AND ($1 = -1 OR priority > $1)
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task_queue AS t
            SET status = 'processing', worker_id = $3, updated_at = NOW()
            FROM due
            WHERE t.id = due.id
            RETURNING {cols}
            "#,
            cols = qualified_columns("t")
        );

        let mut tasks = with_timeout(POLL_TIMEOUT, async {
            sqlx::query_as::<_, Task>(&sql)
                .bind(min_priority)
                .bind(limit)
                .bind(claimed_by)
                .fetch_all(&self.pool)
                .await
                .map_err(TaskError::from)
        })
        .await?;

        // RETURNING does not preserve the CTE order.
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        Ok(tasks)
    }

    /// Atomically claim up to `limit` failed tasks whose retry time has come.
    pub async fn claim_retry_tasks(
        &self,
        limit: i64,
        claimed_by: &str,
    ) -> Result<Vec<Task>, TaskError> {
        let sql = format!(
            r#"
            WITH ready AS (
                SELECT id
                FROM task_queue
                WHERE status = 'failed'
                  AND next_retry_at <= NOW()
                  AND deleted_at IS NULL
                ORDER BY next_retry_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task_queue AS t
            SET status = 'processing', worker_id = $2, updated_at = NOW()
            FROM ready
            WHERE t.id = ready.id
            RETURNING {cols}
            "#,
            cols = qualified_columns("t")
        );

        let mut tasks = with_timeout(POLL_TIMEOUT, async {
            sqlx::query_as::<_, Task>(&sql)
                .bind(limit)
                .bind(claimed_by)
                .fetch_all(&self.pool)
                .await
                .map_err(TaskError::from)
        })
        .await?;

        tasks.sort_by_key(|t| t.next_retry_at);
        Ok(tasks)
    }

    /// Claim one specific pending task (the due-now fast path).
    ///
    /// Returns `None` when the row is no longer pending, e.g. a tier poll
    /// got there first.
    pub async fn claim_by_id(
        &self,
        id: Uuid,
        claimed_by: &str,
    ) -> Result<Option<Task>, TaskError> {
        let sql = format!(
            r#"
            UPDATE task_queue
            SET status = 'processing', worker_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL
            RETURNING {TASK_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(claimed_by)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Put a claimed-but-unsubmitted row back into `pending` so the next
    /// poll sees it again. Clears `next_retry_at` too: retry claims carry
    /// one, and only `failed` rows may hold a retry schedule.
    pub async fn release(&self, id: Uuid) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'pending',
                next_retry_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the mutable fields of a task. Silently no-ops on a missing
    /// row; `scheduled_at` and the identity columns are never rewritten.
    pub async fn update(&self, task: &Task) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $2,
                started_at = $3,
                completed_at = $4,
                retry_count = $5,
                next_retry_at = $6,
                callback_attempts = $7,
                last_callback_at = $8,
                last_callback_status = $9,
                last_callback_error = $10,
                error_message = $11,
                worker_id = $12,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.retry_count)
        .bind(task.next_retry_at)
        .bind(task.callback_attempts)
        .bind(task.last_callback_at)
        .bind(task.last_callback_status)
        .bind(task.last_callback_error.as_deref())
        .bind(task.error_message.as_deref())
        .bind(task.worker_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tombstone a live row. [`TaskError::NotFound`] when the row is missing
    /// or already deleted.
    pub async fn soft_delete(&self, id: Uuid, actor: Option<&str>) -> Result<(), TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET deleted_at = NOW(), deleted_by = $2, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(actor)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound(id));
        }
        Ok(())
    }

    /// Paginated list over live rows; returns the page and the total count
    /// for the same predicates.
    pub async fn list(&self, filter: &ListFilter) -> Result<(Vec<Task>, i64), TaskError> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM task_queue");
        filter.push_predicates(&mut count_qb);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut qb = QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM task_queue"));
        filter.push_predicates(&mut qb);
        qb.push(" ORDER BY ")
            .push(filter.sort_by.column())
            .push(" ")
            .push(filter.sort_order.keyword());
        qb.push(" LIMIT ")
            .push_bind(filter.page.limit)
            .push(" OFFSET ")
            .push_bind(filter.page.offset());

        let tasks = qb.build_query_as::<Task>().fetch_all(&self.pool).await?;
        Ok((tasks, total))
    }

    /// Status → count over live rows.
    pub async fn count_by_status(&self) -> Result<HashMap<TaskStatus, i64>, TaskError> {
        let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM task_queue
            WHERE deleted_at IS NULL
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Physically delete terminal rows past retention, in short batches.
    /// Returns the number of rows removed; a sweep cut short by the soft
    /// timeout resumes on the next tick.
    pub async fn cleanup_expired_data(&self) -> Result<u64, TaskError> {
        let started = Instant::now();
        let mut total = 0u64;
        loop {
            let removed = sqlx::query(
                r#"
                DELETE FROM task_queue
                WHERE id IN (
                    SELECT id
                    FROM task_queue
                    WHERE status IN ('completed', 'dead_lettered')
                      AND completed_at < NOW() - ($1 || ' days')::INTERVAL
                    LIMIT $2
                )
                "#,
            )
            .bind(RETENTION_DAYS.to_string())
            .bind(CLEANUP_BATCH)
            .execute(&self.pool)
            .await?
            .rows_affected();

            total += removed;
            if removed < CLEANUP_BATCH as u64 || started.elapsed() >= CLEANUP_TIMEOUT {
                break;
            }
        }
        Ok(total)
    }

    /// Reap `processing` rows nothing has touched for `stale_after`: the
    /// owning worker is gone. Rows with budget left go back to `pending`
    /// (retry consumed); the rest are dead-lettered.
    pub async fn recover_stale_tasks(
        &self,
        stale_after: Duration,
    ) -> Result<StaleRecovery, TaskError> {
        let stale_secs = stale_after.as_secs().to_string();

        let dead_lettered = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'dead_lettered',
                retry_count = LEAST(retry_count + 1, max_retries),
                started_at = COALESCE(started_at, NOW()),
                completed_at = NOW(),
                next_retry_at = NULL,
                worker_id = NULL,
                error_message = 'worker lost while processing',
                updated_at = NOW()
            WHERE status = 'processing'
              AND deleted_at IS NULL
              AND updated_at < NOW() - ($1 || ' seconds')::INTERVAL
              AND retry_count + 1 > max_retries
            "#,
        )
        .bind(&stale_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND deleted_at IS NULL
              AND updated_at < NOW() - ($1 || ' seconds')::INTERVAL
              AND retry_count + 1 <= max_retries
            "#,
        )
        .bind(&stale_secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(StaleRecovery {
            requeued,
            dead_lettered,
        })
    }
}
