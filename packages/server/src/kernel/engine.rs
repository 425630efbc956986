//! Engine façade: lifecycle and the public task operations.
//!
//! Owns the store connection, the circuit breaker, the deliverer, and, once
//! started, the worker pool and scheduler. The REST layer talks only to
//! this type.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::kernel::stream_hub::StreamHub;
use crate::kernel::tasks::{
    CallbackDeliverer, CircuitBreaker, CircuitBreakerConfig, DelivererConfig, ListFilter,
    Scheduler, SchedulerConfig, Task, TaskError, TaskEvent, TaskStatus, TaskStore, WorkerPool,
    WorkerPoolConfig,
};

/// Hard cap on payload size.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 20;

const MAX_PRIORITY: i32 = 10;
const MAX_RETRY_BUDGET: i32 = 20;
const MIN_CALLBACK_TIMEOUT: i32 = 5;
const MAX_CALLBACK_TIMEOUT: i32 = 300;
const MAX_SCHEDULE_AHEAD_DAYS: i64 = 365;

/// A task submission, before validation.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub payload: Vec<u8>,
    pub callback_url: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub callback_timeout_seconds: Option<i32>,
    pub tags: Vec<String>,
}

/// Defaults applied to submissions that omit optional knobs.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub max_retries: i32,
    pub callback_timeout_seconds: i32,
}

/// Validate a submission and build the entity to insert.
fn build_task(new: NewTask, defaults: &TaskDefaults) -> Result<Task, TaskError> {
    if new.payload.len() > MAX_PAYLOAD_BYTES {
        return Err(TaskError::Validation(format!(
            "payload exceeds {} bytes",
            MAX_PAYLOAD_BYTES
        )));
    }

    let url = Url::parse(&new.callback_url)
        .map_err(|err| TaskError::Validation(format!("invalid callback_url: {}", err)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TaskError::Validation(
            "callback_url must use http or https".to_string(),
        ));
    }
    if url.host_str().is_none() {
        return Err(TaskError::Validation(
            "callback_url must be an absolute URL".to_string(),
        ));
    }

    let priority = new.priority.unwrap_or(0);
    if !(0..=MAX_PRIORITY).contains(&priority) {
        return Err(TaskError::Validation(format!(
            "priority must be between 0 and {}, got {}",
            MAX_PRIORITY, priority
        )));
    }

    let max_retries = new.max_retries.unwrap_or(defaults.max_retries);
    if !(0..=MAX_RETRY_BUDGET).contains(&max_retries) {
        return Err(TaskError::Validation(format!(
            "max_retries must be between 0 and {}, got {}",
            MAX_RETRY_BUDGET, max_retries
        )));
    }

    let callback_timeout = new
        .callback_timeout_seconds
        .unwrap_or(defaults.callback_timeout_seconds);
    if !(MIN_CALLBACK_TIMEOUT..=MAX_CALLBACK_TIMEOUT).contains(&callback_timeout) {
        return Err(TaskError::Validation(format!(
            "callback_timeout_seconds must be between {} and {}, got {}",
            MIN_CALLBACK_TIMEOUT, MAX_CALLBACK_TIMEOUT, callback_timeout
        )));
    }

    // Past times are fine and mean "execute immediately".
    let now = Utc::now();
    let scheduled_at = new.scheduled_at.unwrap_or(now);
    if scheduled_at > now + chrono::Duration::days(MAX_SCHEDULE_AHEAD_DAYS) {
        return Err(TaskError::Validation(
            "scheduled_at must be within one year".to_string(),
        ));
    }

    Ok(Task::builder()
        .name(new.name)
        .payload(new.payload)
        .callback_url(new.callback_url)
        .scheduled_at(scheduled_at)
        .priority(priority)
        .max_retries(max_retries)
        .callback_timeout_seconds(callback_timeout)
        .tags(new.tags)
        .build())
}

// =============================================================================
// Health & stats
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub store: StoreStatus,
    pub scheduler: bool,
    pub workers: WorkerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}

// =============================================================================
// Engine
// =============================================================================

struct EngineRuntime {
    workers: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
}

pub struct Engine {
    db: PgPool,
    store: TaskStore,
    hub: StreamHub,
    deliverer: Arc<CallbackDeliverer>,
    defaults: TaskDefaults,
    pool_config: WorkerPoolConfig,
    scheduler_config: SchedulerConfig,
    runtime: tokio::sync::RwLock<Option<EngineRuntime>>,
    owns_pool: bool,
}

impl Engine {
    /// Open a connection pool from the configuration, optionally run
    /// migrations, and assemble the engine.
    pub async fn init(config: &Config) -> Result<Self, TaskError> {
        let db = &config.database;
        if db.url.is_empty() {
            return Err(TaskError::Validation("database.url must be set".to_string()));
        }
        let options: PgConnectOptions = db
            .url
            .parse()
            .map_err(|err| TaskError::Validation(format!("invalid database url: {}", err)))?;
        let options = options.options([("timezone", db.timezone.clone())]);

        let pool = PgPoolOptions::new()
            .max_connections(db.max_open_conns)
            .min_connections(db.max_idle_conns)
            .max_lifetime(db.conn_max_lifetime)
            .idle_timeout(db.conn_max_idle_time)
            .connect_with(options)
            .await?;

        if db.auto_migrate {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|err| TaskError::Internal(format!("migration failed: {}", err)))?;
            info!("migrations applied");
        }

        Self::from_parts(pool, config, true)
    }

    /// Adopt an existing pool (embedding and tests). The engine will not
    /// close it on shutdown.
    pub fn with_pool(pool: PgPool, config: &Config) -> Result<Self, TaskError> {
        Self::from_parts(pool, config, false)
    }

    fn from_parts(pool: PgPool, config: &Config, owns_pool: bool) -> Result<Self, TaskError> {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let deliverer = CallbackDeliverer::new(
            Arc::clone(&breaker),
            DelivererConfig {
                secret: config.callback.secret(),
                default_timeout: Some(config.callback.default_timeout),
            },
        )
        .map_err(|err| TaskError::Internal(format!("failed to build http client: {}", err)))?;

        Ok(Self {
            store: TaskStore::new(pool.clone()),
            db: pool,
            hub: StreamHub::new(),
            deliverer: Arc::new(deliverer),
            defaults: TaskDefaults {
                max_retries: config.callback.default_max_retries,
                callback_timeout_seconds: config.callback.default_timeout.as_secs() as i32,
            },
            pool_config: WorkerPoolConfig {
                pool_size: config.worker.pool_size,
            },
            scheduler_config: SchedulerConfig {
                high_priority_interval: config.scheduler.high_priority_interval,
                normal_priority_interval: config.scheduler.normal_priority_interval,
                cleanup_interval: config.scheduler.cleanup_interval,
                stale_recovery_after: config.scheduler.stale_recovery_after,
            },
            runtime: tokio::sync::RwLock::new(None),
            owns_pool,
        })
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Start the worker pool and scheduler. Fails with
    /// [`TaskError::AlreadyStarted`] if already running.
    pub async fn start(&self) -> Result<(), TaskError> {
        let mut runtime = self.runtime.write().await;
        if runtime.is_some() {
            return Err(TaskError::AlreadyStarted);
        }

        // Rows stranded in `processing` by a previous run have no owner.
        match self
            .store
            .recover_stale_tasks(self.scheduler_config.stale_recovery_after)
            .await
        {
            Ok(recovery) if recovery.requeued > 0 || recovery.dead_lettered > 0 => {
                warn!(
                    requeued = recovery.requeued,
                    dead_lettered = recovery.dead_lettered,
                    "recovered stranded tasks at startup"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "startup stale recovery failed"),
        }

        let workers = Arc::new(WorkerPool::start(
            self.pool_config.clone(),
            self.store.clone(),
            Arc::clone(&self.deliverer),
            self.hub.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            Arc::clone(&workers),
            self.scheduler_config.clone(),
        ));
        scheduler.start().await;

        *runtime = Some(EngineRuntime { workers, scheduler });
        info!("task engine started");
        Ok(())
    }

    /// Stop scheduler and workers, honouring `deadline`. Tears down what it
    /// can even when the deadline is exceeded.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), TaskError> {
        let runtime = self.runtime.write().await.take();

        let result = match runtime {
            None => Ok(()),
            Some(runtime) => {
                let teardown = async {
                    runtime.scheduler.shutdown().await;
                    runtime.workers.shutdown().await;
                };
                match tokio::time::timeout(deadline, teardown).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        warn!(deadline_secs = deadline.as_secs(), "shutdown deadline exceeded");
                        Err(TaskError::ShutdownTimeout(deadline))
                    }
                }
            }
        };

        if self.owns_pool {
            self.db.close().await;
        }
        info!("task engine stopped");
        result
    }

    pub async fn health(&self) -> EngineHealth {
        let runtime = self.runtime.read().await;
        let (scheduler_running, workers) = match runtime.as_ref() {
            Some(runtime) => (
                runtime.scheduler.is_running(),
                WorkerStats {
                    active: runtime.workers.active_workers(),
                    total: runtime.workers.size(),
                },
            ),
            None => (false, WorkerStats { active: 0, total: 0 }),
        };

        let ping = tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query("SELECT 1").execute(&self.db),
        )
        .await;
        let (store, error) = match ping {
            Ok(Ok(_)) => (StoreStatus::Connected, None),
            Ok(Err(err)) => (StoreStatus::Disconnected, Some(err.to_string())),
            Err(_) => (
                StoreStatus::Disconnected,
                Some("store ping timed out".to_string()),
            ),
        };

        let status = if runtime.is_none() {
            HealthStatus::Stopped
        } else if store == StoreStatus::Connected && scheduler_running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        EngineHealth {
            status,
            store,
            scheduler: scheduler_running,
            workers,
            error,
        }
    }

    // =========================================================================
    // Public task operations
    // =========================================================================

    /// Validate and store a submission. Due-now tasks skip the polling delay
    /// through the scheduler's immediate-submit path.
    pub async fn create_task(&self, new: NewTask) -> Result<Task, TaskError> {
        let task = build_task(new, &self.defaults)?;
        let task = self.store.create(&task).await?;
        self.hub.publish(TaskEvent::Created {
            task_id: task.id,
            name: task.name.clone(),
            priority: task.priority,
            scheduled_at: task.scheduled_at,
        });

        if task.should_execute_now() {
            if let Some(runtime) = self.runtime.read().await.as_ref() {
                runtime.scheduler.submit_immediately(task.id).await;
            }
        }
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, TaskError> {
        self.store.find_by_id(id).await
    }

    pub async fn list_tasks(&self, filter: ListFilter) -> Result<(Vec<Task>, i64), TaskError> {
        self.store.list(&filter).await
    }

    /// Soft-delete a pending or failed task.
    pub async fn delete_task(&self, id: Uuid, actor: Option<&str>) -> Result<(), TaskError> {
        let task = self.store.find_by_id(id).await?;
        if !task.can_be_deleted() {
            return Err(TaskError::InvalidStatus {
                id,
                status: task.status,
            });
        }
        self.store.soft_delete(id, actor).await?;
        self.hub.publish(TaskEvent::Deleted {
            task_id: id,
            deleted_by: actor.map(str::to_string),
        });
        Ok(())
    }

    /// Reset a failed task to pending with a fresh retry budget. Repeating
    /// the call on an already-reset task is a no-op.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task, TaskError> {
        let mut task = self.store.find_by_id(id).await?;
        match task.status {
            TaskStatus::Failed => {
                task.status = TaskStatus::Pending;
                task.retry_count = 0;
                task.next_retry_at = None;
                task.error_message = None;
                task.worker_id = None;
                self.store.update(&task).await?;
                self.hub.publish(TaskEvent::Retried { task_id: id });
                Ok(task)
            }
            TaskStatus::Pending if task.retry_count == 0 && task.next_retry_at.is_none() => {
                Ok(task)
            }
            status => Err(TaskError::InvalidStatus { id, status }),
        }
    }

    /// Return a dead-lettered task to pending with its execution history
    /// cleared. Callback attempt telemetry is preserved.
    pub async fn resurrect_task(&self, id: Uuid) -> Result<Task, TaskError> {
        let mut task = self.store.find_by_id(id).await?;
        if task.status != TaskStatus::DeadLettered {
            return Err(TaskError::InvalidStatus {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Pending;
        task.retry_count = 0;
        task.next_retry_at = None;
        task.started_at = None;
        task.completed_at = None;
        task.error_message = None;
        task.worker_id = None;
        self.store.update(&task).await?;
        self.hub.publish(TaskEvent::Resurrected { task_id: id });
        Ok(task)
    }

    pub async fn stats(&self) -> Result<TaskStats, TaskError> {
        let counts = self.store.count_by_status().await?;
        let get = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);
        let stats = TaskStats {
            pending: get(TaskStatus::Pending),
            processing: get(TaskStatus::Processing),
            completed: get(TaskStatus::Completed),
            failed: get(TaskStatus::Failed),
            dead_lettered: get(TaskStatus::DeadLettered),
            total: counts.values().sum(),
        };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TaskDefaults {
        TaskDefaults {
            max_retries: 5,
            callback_timeout_seconds: 30,
        }
    }

    fn submission() -> NewTask {
        NewTask {
            name: "notify".to_string(),
            payload: br#"{"k":"v"}"#.to_vec(),
            callback_url: "https://example.com/hook".to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn defaults_are_applied() {
        let task = build_task(submission(), &defaults()).unwrap();
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.callback_timeout_seconds, 30);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.should_execute_now());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut new = submission();
        new.payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            build_task(new, &defaults()),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn payload_at_the_limit_is_accepted() {
        let mut new = submission();
        new.payload = vec![0u8; MAX_PAYLOAD_BYTES];
        assert!(build_task(new, &defaults()).is_ok());
    }

    #[test]
    fn relative_and_non_http_urls_are_rejected() {
        for url in ["not a url", "/relative/path", "ftp://example.com/x", "mailto:x@y.z"] {
            let mut new = submission();
            new.callback_url = url.to_string();
            assert!(
                matches!(build_task(new, &defaults()), Err(TaskError::Validation(_))),
                "expected rejection for {}",
                url
            );
        }
    }

    #[test]
    fn priority_bounds_are_enforced() {
        let mut new = submission();
        new.priority = Some(11);
        assert!(build_task(new.clone(), &defaults()).is_err());
        new.priority = Some(-1);
        assert!(build_task(new.clone(), &defaults()).is_err());
        new.priority = Some(10);
        assert!(build_task(new, &defaults()).is_ok());
    }

    #[test]
    fn retry_budget_bounds_are_enforced() {
        let mut new = submission();
        new.max_retries = Some(21);
        assert!(build_task(new.clone(), &defaults()).is_err());
        new.max_retries = Some(0);
        assert!(build_task(new, &defaults()).is_ok());
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        let mut new = submission();
        new.callback_timeout_seconds = Some(4);
        assert!(build_task(new.clone(), &defaults()).is_err());
        new.callback_timeout_seconds = Some(301);
        assert!(build_task(new.clone(), &defaults()).is_err());
        new.callback_timeout_seconds = Some(300);
        assert!(build_task(new, &defaults()).is_ok());
    }

    #[test]
    fn far_future_schedules_are_rejected_but_past_is_immediate() {
        let mut new = submission();
        new.scheduled_at = Some(Utc::now() + chrono::Duration::days(400));
        assert!(build_task(new.clone(), &defaults()).is_err());

        new.scheduled_at = Some(Utc::now() - chrono::Duration::hours(2));
        let task = build_task(new, &defaults()).unwrap();
        assert!(task.should_execute_now());
    }
}
