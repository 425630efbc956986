//! Tiered polling scheduler.
//!
//! Three independent tickers share the store's claim protocol:
//!
//! | tier    | default interval | scope                     | batch |
//! |---------|------------------|---------------------------|-------|
//! | high    | 2 s              | priority > 5              | 50    |
//! | normal  | 3 s              | any priority              | 100   |
//! | cleanup | 30 s             | any priority + housekeeping | 200 |
//!
//! A tick that finds no due pending work polls retry-ready failed tasks
//! instead. Claims that cannot be handed to the pool (queue full) are
//! released so the next poll sees them again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::pool::WorkerPool;
use super::store::TaskStore;
use super::task::{TaskStatus, HIGH_PRIORITY_THRESHOLD};

const HIGH_TIER_LIMIT: i64 = 50;
const NORMAL_TIER_LIMIT: i64 = 100;
const CLEANUP_TIER_LIMIT: i64 = 200;

/// Claims any priority when passed as `min_priority`.
const ANY_PRIORITY: i32 = -1;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub high_priority_interval: Duration,
    pub normal_priority_interval: Duration,
    pub cleanup_interval: Duration,
    /// `processing` rows untouched for this long are reaped.
    pub stale_recovery_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_priority_interval: Duration::from_secs(2),
            normal_priority_interval: Duration::from_secs(3),
            cleanup_interval: Duration::from_secs(30),
            stale_recovery_after: Duration::from_secs(600),
        }
    }
}

pub struct Scheduler {
    store: TaskStore,
    pool: Arc<WorkerPool>,
    config: SchedulerConfig,
    claim_tag: String,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(store: TaskStore, pool: Arc<WorkerPool>, config: SchedulerConfig) -> Self {
        Self {
            store,
            pool,
            config,
            claim_tag: format!("scheduler-{}", Uuid::new_v4()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the three tier loops.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;

        let high = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            high.tick_loop(
                high.config.high_priority_interval,
                HIGH_PRIORITY_THRESHOLD,
                HIGH_TIER_LIMIT,
                false,
            )
            .await;
        }));

        let normal = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            normal
                .tick_loop(
                    normal.config.normal_priority_interval,
                    ANY_PRIORITY,
                    NORMAL_TIER_LIMIT,
                    false,
                )
                .await;
        }));

        let cleanup = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            cleanup
                .tick_loop(
                    cleanup.config.cleanup_interval,
                    ANY_PRIORITY,
                    CLEANUP_TIER_LIMIT,
                    true,
                )
                .await;
        }));

        self.running.store(true, Ordering::SeqCst);
        info!(
            high_ms = self.config.high_priority_interval.as_millis() as u64,
            normal_ms = self.config.normal_priority_interval.as_millis() as u64,
            cleanup_ms = self.config.cleanup_interval.as_millis() as u64,
            "scheduler started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop all tickers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        futures::future::join_all(handles).await;
        info!("scheduler stopped");
    }

    /// Due-now fast path used at submission time: claim the specific row and
    /// offer it, skipping the polling delay. A lost race or a full queue is
    /// fine; the next poll picks the task up.
    pub async fn submit_immediately(&self, task_id: Uuid) {
        match self.store.claim_by_id(task_id, &self.claim_tag).await {
            Ok(Some(task)) => {
                debug!(task_id = %task_id, "immediate submit");
                self.offer(task).await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "immediate claim failed");
            }
        }
    }

    async fn tick_loop(&self, interval: Duration, min_priority: i32, limit: i64, cleanup: bool) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_tier(min_priority, limit).await;
                    if cleanup {
                        self.run_cleanup().await;
                    }
                }
            }
        }
    }

    async fn poll_tier(&self, min_priority: i32, limit: i64) {
        let claimed = match self
            .store
            .claim_due_tasks(min_priority, limit, &self.claim_tag)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(min_priority, error = %err, "due-task poll failed");
                return;
            }
        };

        if claimed.is_empty() {
            self.poll_retries(limit).await;
            return;
        }

        debug!(count = claimed.len(), min_priority, "claimed due tasks");
        for task in claimed {
            self.offer(task).await;
        }
    }

    /// Pick up retry-ready failed tasks; only runs on ticks with no due
    /// pending work, so a backlog of new submissions takes precedence.
    async fn poll_retries(&self, limit: i64) {
        match self.store.claim_retry_tasks(limit, &self.claim_tag).await {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    debug!(count = tasks.len(), "claimed retry-ready tasks");
                }
                for mut task in tasks {
                    task.status = TaskStatus::Pending;
                    self.offer(task).await;
                }
            }
            Err(err) => {
                error!(error = %err, "retry poll failed");
            }
        }
    }

    async fn offer(&self, task: super::task::Task) {
        let task_id = task.id;
        if !self.pool.try_submit(task) {
            debug!(task_id = %task_id, "worker queue full, releasing claim");
            if let Err(err) = self.store.release(task_id).await {
                error!(task_id = %task_id, error = %err, "failed to release claim");
            }
        }
    }

    async fn run_cleanup(&self) {
        match self.store.cleanup_expired_data().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired tasks cleaned up"),
            Err(err) => error!(error = %err, "cleanup failed"),
        }

        match self
            .store
            .recover_stale_tasks(self.config.stale_recovery_after)
            .await
        {
            Ok(recovery) if recovery.requeued > 0 || recovery.dead_lettered > 0 => {
                warn!(
                    requeued = recovery.requeued,
                    dead_lettered = recovery.dead_lettered,
                    "recovered stale processing tasks"
                );
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stale task recovery failed"),
        }
    }
}
