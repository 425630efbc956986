//! Worker pool: a fixed set of executors draining a bounded in-memory queue.
//!
//! The scheduler (and the due-now fast path) hand claimed tasks to the pool
//! with a non-blocking [`try_submit`](WorkerPool::try_submit); a full queue
//! pushes back and the claim is released for the next poll. Each worker runs
//! the full attempt cycle: mark processing, deliver, apply the outcome as a
//! state transition, persist, broadcast.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kernel::stream_hub::StreamHub;

use super::deliverer::{CallbackDeliverer, DeliveryOutcome};
use super::events::TaskEvent;
use super::store::TaskStore;
use super::task::Task;

/// How long shutdown waits for in-flight tasks before abandoning the queue.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { pool_size: 20 }
    }
}

struct WorkerContext {
    worker_id: String,
    store: TaskStore,
    deliverer: Arc<CallbackDeliverer>,
    hub: StreamHub,
    queue: Arc<Mutex<mpsc::Receiver<Task>>>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `config.pool_size` workers over a queue of capacity `2 * size`.
    pub fn start(
        config: WorkerPoolConfig,
        store: TaskStore,
        deliverer: Arc<CallbackDeliverer>,
        hub: StreamHub,
    ) -> Self {
        let size = config.pool_size.max(1);
        let (tx, rx) = mpsc::channel::<Task>(size * 2);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..size)
            .map(|n| {
                let ctx = WorkerContext {
                    worker_id: format!("worker-{}", n + 1),
                    store: store.clone(),
                    deliverer: Arc::clone(&deliverer),
                    hub: hub.clone(),
                    queue: Arc::clone(&rx),
                    shutdown: shutdown.clone(),
                    active: Arc::clone(&active),
                };
                tokio::spawn(worker_loop(ctx))
            })
            .collect();

        info!(pool_size = size, "worker pool started");
        Self {
            tx,
            handles: Mutex::new(handles),
            shutdown,
            active,
            size,
        }
    }

    /// Offer a claimed task to the pool. Returns `false` when the queue is
    /// full; the caller must release the claim so the task stays visible to
    /// the next poll.
    pub fn try_submit(&self, task: Task) -> bool {
        self.tx.try_send(task).is_ok()
    }

    /// Workers currently executing a task.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop the pool: workers finish their current task and exit. Logs a
    /// warning and abandons the queue if the drain exceeds the grace period.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "workers did not drain in time, abandoning queue"
            );
        } else {
            info!("worker pool stopped");
        }
    }
}

async fn worker_loop(ctx: WorkerContext) {
    debug!(worker_id = %ctx.worker_id, "worker started");
    loop {
        // Hold the queue lock only while waiting for the next task.
        let task = {
            let mut queue = ctx.queue.lock().await;
            tokio::select! {
                _ = ctx.shutdown.cancelled() => None,
                task = queue.recv() => task,
            }
        };
        let Some(task) = task else { break };

        ctx.active.fetch_add(1, Ordering::SeqCst);
        let task_id = task.id;
        let result = AssertUnwindSafe(process_task(&ctx, task)).catch_unwind().await;
        ctx.active.fetch_sub(1, Ordering::SeqCst);

        if result.is_err() {
            // The row stays in `processing`; the stale reaper will pick it up.
            error!(
                worker_id = %ctx.worker_id,
                task_id = %task_id,
                "worker recovered from panic, task left in processing"
            );
        }

        if ctx.shutdown.is_cancelled() {
            break;
        }
    }
    debug!(worker_id = %ctx.worker_id, "worker stopped");
}

/// One full attempt cycle for a claimed task.
///
/// Store failures short-circuit without further mutation: the row is either
/// still claimed (reaper territory) or untouched, and the next poll
/// re-presents it. Delivery failures never propagate; they become state
/// transitions.
async fn process_task(ctx: &WorkerContext, mut task: Task) {
    task.mark_processing(&ctx.worker_id);
    if let Err(err) = ctx.store.update(&task).await {
        error!(task_id = %task.id, error = %err, "failed to persist processing transition");
        return;
    }
    ctx.hub.publish(TaskEvent::Started {
        task_id: task.id,
        worker_id: ctx.worker_id.clone(),
        attempt: task.retry_count + 1,
    });

    let outcome = ctx.deliverer.deliver(&mut task).await;
    match &outcome {
        DeliveryOutcome::Delivered { status } => {
            task.mark_completed();
            if persist(ctx, &task).await {
                info!(task_id = %task.id, status = *status, "task completed");
                let duration_ms = task
                    .started_at
                    .map(|started| (Utc::now() - started).num_milliseconds())
                    .unwrap_or(0);
                ctx.hub.publish(TaskEvent::Completed {
                    task_id: task.id,
                    callback_status: task.last_callback_status,
                    duration_ms,
                });
            }
        }
        DeliveryOutcome::Transient { .. } | DeliveryOutcome::CircuitOpen => {
            let error = match &outcome {
                DeliveryOutcome::Transient { error, .. } => error.clone(),
                _ => format!("circuit open for {}", task.callback_url),
            };
            task.mark_failed(&error);
            if task.can_retry() {
                if persist(ctx, &task).await {
                    warn!(
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        error = %error,
                        "task failed, retry scheduled"
                    );
                    ctx.hub.publish(TaskEvent::Failed {
                        task_id: task.id,
                        error,
                        retry_count: task.retry_count,
                        next_retry_at: task.next_retry_at,
                    });
                }
            } else {
                task.mark_dead_lettered();
                if persist(ctx, &task).await {
                    warn!(
                        task_id = %task.id,
                        attempts = task.callback_attempts,
                        error = %error,
                        "retry budget exhausted, task dead-lettered"
                    );
                    ctx.hub.publish(TaskEvent::DeadLettered {
                        task_id: task.id,
                        error: task.error_message.clone(),
                        total_attempts: task.callback_attempts,
                    });
                }
            }
        }
        DeliveryOutcome::Permanent { status, error } => {
            // Non-retryable rejection: straight to the dead letter queue,
            // no retry consumed.
            task.error_message = Some(error.clone());
            task.mark_dead_lettered();
            if persist(ctx, &task).await {
                warn!(
                    task_id = %task.id,
                    status = *status,
                    error = %error,
                    "permanent rejection, task dead-lettered"
                );
                ctx.hub.publish(TaskEvent::DeadLettered {
                    task_id: task.id,
                    error: task.error_message.clone(),
                    total_attempts: task.callback_attempts,
                });
            }
        }
    }
}

async fn persist(ctx: &WorkerContext, task: &Task) -> bool {
    match ctx.store.update(task).await {
        Ok(()) => true,
        Err(err) => {
            error!(task_id = %task.id, error = %err, "failed to persist task transition");
            false
        }
    }
}
