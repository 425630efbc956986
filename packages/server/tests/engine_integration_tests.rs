//! Store and engine tests against a real Postgres.
//!
//! These need `TEST_DATABASE_URL` pointing at a Postgres instance and are
//! `#[ignore]`d so the default suite passes without infrastructure:
//!
//! ```sh
//! TEST_DATABASE_URL=postgres://localhost/courier_test cargo test -- --ignored
//! ```
//!
//! Each test works in its own schema, so they can run concurrently.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use courier_core::kernel::engine::NewTask;
use courier_core::kernel::tasks::{ListFilter, Task, TaskError, TaskStatus, TaskStore};
use courier_core::{Config, Engine};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn fresh_pool(schema: &str) -> PgPool {
    let url = env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must point at a Postgres instance");
    let options: PgConnectOptions = url.parse().expect("valid TEST_DATABASE_URL");

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options.clone())
        .await
        .expect("connect admin");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .unwrap();
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(options.options([("search_path", schema)]))
        .await
        .expect("connect test schema");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn due_task(name: &str, url: &str) -> Task {
    Task::builder()
        .name(name)
        .payload(br#"{"k":"v"}"#.to_vec())
        .callback_url(url)
        .scheduled_at(Utc::now() - ChronoDuration::seconds(2))
        .build()
}

fn test_config(pool_size: usize) -> Config {
    let mut config = Config::default();
    config.worker.pool_size = pool_size;
    config.scheduler.high_priority_interval = Duration::from_millis(500);
    config.scheduler.normal_priority_interval = Duration::from_millis(700);
    config.scheduler.cleanup_interval = Duration::from_secs(5);
    config
}

async fn wait_for_status(store: &TaskStore, id: uuid::Uuid, wanted: TaskStatus) -> Task {
    for _ in 0..50 {
        let task = store.find_by_id(id).await.unwrap();
        if task.status == wanted {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("task {} never reached {:?}", id, wanted);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn create_and_fetch_round_trips_payload_and_timestamps() {
    let store = TaskStore::new(fresh_pool("t_roundtrip").await);
    let task = due_task("roundtrip", "https://example.com/hook");

    let created = store.create(&task).await.unwrap();
    let fetched = store.find_by_id(task.id).await.unwrap();

    assert_eq!(fetched.payload, task.payload);
    assert_eq!(fetched.name, task.name);
    assert_eq!(fetched.tags, task.tags);
    // Postgres keeps microsecond precision.
    assert_eq!(
        fetched.created_at.timestamp_micros(),
        task.created_at.timestamp_micros()
    );
    assert_eq!(
        fetched.scheduled_at.timestamp_micros(),
        task.scheduled_at.timestamp_micros()
    );
    assert_eq!(created.id, fetched.id);

    // Same id again conflicts.
    assert!(matches!(
        store.create(&task).await,
        Err(TaskError::Conflict(_))
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn concurrent_claims_never_hand_out_the_same_row() {
    let store = TaskStore::new(fresh_pool("t_claims").await);
    for n in 0..20 {
        store
            .create(&due_task(&format!("claim-{}", n), "https://example.com/hook"))
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        store.claim_due_tasks(-1, 20, "poller-a"),
        store.claim_due_tasks(-1, 20, "poller-b"),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.len() + b.len(), 20);
    for task in &a {
        assert!(!b.iter().any(|other| other.id == task.id), "double claim");
    }

    // Everything is now processing; nothing left to claim.
    assert!(store.claim_due_tasks(-1, 20, "poller-c").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn claims_order_by_priority_then_schedule_and_respect_the_floor() {
    let store = TaskStore::new(fresh_pool("t_order").await);
    let base = Utc::now() - ChronoDuration::seconds(60);
    for (n, priority) in [(0, 0), (1, 9), (2, 9), (3, 4)] {
        let task = Task::builder()
            .name(format!("order-{}", n))
            .payload(b"{}".to_vec())
            .callback_url("https://example.com/hook")
            .scheduled_at(base + ChronoDuration::seconds(n))
            .priority(priority)
            .build();
        store.create(&task).await.unwrap();
    }
    // Not yet due; must never be claimed.
    let future = Task::builder()
        .name("future")
        .payload(b"{}".to_vec())
        .callback_url("https://example.com/hook")
        .scheduled_at(Utc::now() + ChronoDuration::hours(1))
        .priority(9)
        .build();
    store.create(&future).await.unwrap();

    let high_only = store.claim_due_tasks(5, 10, "poller").await.unwrap();
    assert_eq!(high_only.len(), 2);
    assert!(high_only.iter().all(|t| t.priority == 9));
    assert!(high_only[0].scheduled_at <= high_only[1].scheduled_at);

    let rest = store.claim_due_tasks(-1, 10, "poller").await.unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].priority, 4);
    assert_eq!(rest[1].priority, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn released_claims_become_visible_again() {
    let store = TaskStore::new(fresh_pool("t_release").await);
    let task = due_task("release", "https://example.com/hook");
    store.create(&task).await.unwrap();

    let claimed = store.claim_due_tasks(-1, 10, "poller").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(store.claim_due_tasks(-1, 10, "poller").await.unwrap().is_empty());

    store.release(task.id).await.unwrap();
    let reclaimed = store.claim_due_tasks(-1, 10, "poller").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, task.id);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn released_retry_claims_clear_their_retry_schedule() {
    let store = TaskStore::new(fresh_pool("t_release_retry").await);

    let mut failed = due_task("retry-release", "https://example.com/hook");
    failed.status = TaskStatus::Failed;
    failed.retry_count = 1;
    failed.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(5));
    store.create(&failed).await.unwrap();

    let claimed = store.claim_retry_tasks(10, "poller").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, failed.id);

    // Full worker queue: the claim goes back, and the row must not end up
    // pending with a retry schedule still attached.
    store.release(failed.id).await.unwrap();

    let released = store.find_by_id(failed.id).await.unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.next_retry_at.is_none());
    assert!(released.worker_id.is_none());
    assert_eq!(released.retry_count, 1);

    // The row is due and surfaces on the next pending poll.
    let reclaimed = store.claim_due_tasks(-1, 10, "poller").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, failed.id);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn retry_claims_pick_up_only_ripe_failures() {
    let store = TaskStore::new(fresh_pool("t_retry").await);

    let mut ripe = due_task("ripe", "https://example.com/hook");
    ripe.status = TaskStatus::Failed;
    ripe.retry_count = 1;
    ripe.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(5));
    store.create(&ripe).await.unwrap();

    let mut unripe = due_task("unripe", "https://example.com/hook");
    unripe.status = TaskStatus::Failed;
    unripe.retry_count = 1;
    unripe.next_retry_at = Some(Utc::now() + ChronoDuration::hours(1));
    store.create(&unripe).await.unwrap();

    let claimed = store.claim_retry_tasks(10, "poller").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, ripe.id);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn soft_delete_hides_the_row_but_keeps_it() {
    let store = TaskStore::new(fresh_pool("t_softdel").await);
    let task = due_task("softdel", "https://example.com/hook");
    store.create(&task).await.unwrap();

    store.soft_delete(task.id, Some("ops")).await.unwrap();

    assert!(matches!(
        store.find_by_id(task.id).await,
        Err(TaskError::NotFound(_))
    ));
    let (tasks, total) = store.list(&ListFilter::default()).await.unwrap();
    assert_eq!(total, 0);
    assert!(tasks.is_empty());
    assert!(store.claim_due_tasks(-1, 10, "poller").await.unwrap().is_empty());

    // The tombstoned row is still there and cleanup leaves it alone.
    let (deleted_by,): (Option<String>,) =
        sqlx::query_as("SELECT deleted_by FROM task_queue WHERE id = $1")
            .bind(task.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(deleted_by.as_deref(), Some("ops"));
    assert_eq!(store.cleanup_expired_data().await.unwrap(), 0);

    // Deleting again reports missing.
    assert!(matches!(
        store.soft_delete(task.id, None).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn list_filters_by_status_tags_and_priority() {
    let store = TaskStore::new(fresh_pool("t_list").await);

    let mut urgent = due_task("urgent", "https://example.com/hook");
    urgent.priority = 8;
    urgent.tags = vec!["billing".to_string(), "urgent".to_string()];
    store.create(&urgent).await.unwrap();

    let mut done = due_task("done", "https://example.com/hook");
    done.status = TaskStatus::Completed;
    done.started_at = Some(Utc::now());
    done.completed_at = Some(Utc::now());
    store.create(&done).await.unwrap();

    let filter = ListFilter {
        status: Some(TaskStatus::Pending),
        ..ListFilter::default()
    };
    let (tasks, total) = store.list(&filter).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(tasks[0].name, "urgent");

    let filter = ListFilter {
        tags: vec!["billing".to_string()],
        ..ListFilter::default()
    };
    let (_, total) = store.list(&filter).await.unwrap();
    assert_eq!(total, 1);

    let filter = ListFilter {
        min_priority: Some(9),
        ..ListFilter::default()
    };
    let (_, total) = store.list(&filter).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn retry_is_idempotent_and_resurrect_clears_history() {
    let pool = fresh_pool("t_ops").await;
    let engine = Engine::with_pool(pool, &test_config(2)).unwrap();
    let store = engine.store().clone();

    let created = engine
        .create_task(NewTask {
            name: "ops".to_string(),
            payload: b"{}".to_vec(),
            callback_url: "https://example.com/hook".to_string(),
            scheduled_at: Some(Utc::now() + ChronoDuration::hours(1)),
            ..NewTask::default()
        })
        .await
        .unwrap();

    // Simulate a worker failure cycle.
    let mut failed = store.find_by_id(created.id).await.unwrap();
    failed.mark_processing("worker-1");
    failed.mark_failed("callback returned 503");
    store.update(&failed).await.unwrap();

    let after_first = engine.retry_task(created.id).await.unwrap();
    assert_eq!(after_first.status, TaskStatus::Pending);
    assert_eq!(after_first.retry_count, 0);
    assert!(after_first.next_retry_at.is_none());

    // Second call is a no-op with the same resulting state.
    let after_second = engine.retry_task(created.id).await.unwrap();
    assert_eq!(after_second.status, TaskStatus::Pending);
    assert_eq!(after_second.retry_count, 0);
    assert!(after_second.next_retry_at.is_none());

    // Retry of a terminal task is rejected.
    let mut completed = store.find_by_id(created.id).await.unwrap();
    completed.mark_processing("worker-1");
    completed.mark_completed();
    store.update(&completed).await.unwrap();
    assert!(matches!(
        engine.retry_task(created.id).await,
        Err(TaskError::InvalidStatus { .. })
    ));

    // Dead-letter, then resurrect.
    let mut dead = store.find_by_id(created.id).await.unwrap();
    dead.mark_failed("callback returned 404");
    dead.mark_dead_lettered();
    store.update(&dead).await.unwrap();

    let resurrected = engine.resurrect_task(created.id).await.unwrap();
    assert_eq!(resurrected.status, TaskStatus::Pending);
    assert_eq!(resurrected.retry_count, 0);
    assert!(resurrected.started_at.is_none());
    assert!(resurrected.completed_at.is_none());
    assert!(resurrected.error_message.is_none());

    // Resurrecting a non-dead task is rejected.
    assert!(matches!(
        engine.resurrect_task(created.id).await,
        Err(TaskError::InvalidStatus { .. })
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn happy_path_delivers_and_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pool = fresh_pool("t_e2e").await;
    let engine = Arc::new(Engine::with_pool(pool, &test_config(4)).unwrap());
    engine.start().await.unwrap();
    assert!(matches!(
        engine.start().await,
        Err(TaskError::AlreadyStarted)
    ));

    let created = engine
        .create_task(NewTask {
            name: "happy".to_string(),
            payload: br#"{"event":"signup"}"#.to_vec(),
            callback_url: format!("{}/hook", server.uri()),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let done = wait_for_status(engine.store(), created.id, TaskStatus::Completed).await;
    assert_eq!(done.callback_attempts, 1);
    assert_eq!(done.last_callback_status, Some(200));
    assert!(done.completed_at.is_some());
    assert!(done.started_at.is_some());

    engine.shutdown(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn permanent_rejection_dead_letters_without_consuming_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let pool = fresh_pool("t_e2e404").await;
    let engine = Arc::new(Engine::with_pool(pool, &test_config(2)).unwrap());
    engine.start().await.unwrap();

    let created = engine
        .create_task(NewTask {
            name: "reject".to_string(),
            payload: b"{}".to_vec(),
            callback_url: format!("{}/hook", server.uri()),
            max_retries: Some(5),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let dead = wait_for_status(engine.store(), created.id, TaskStatus::DeadLettered).await;
    assert_eq!(dead.retry_count, 0);
    assert_eq!(dead.callback_attempts, 1);
    assert_eq!(dead.last_callback_status, Some(404));
    assert!(dead.error_message.as_deref().unwrap().contains("404"));
    assert!(dead.completed_at.is_some());

    engine.shutdown(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn stats_count_live_rows_by_status() {
    let pool = fresh_pool("t_stats").await;
    let engine = Engine::with_pool(pool, &test_config(2)).unwrap();
    let store = engine.store();

    store.create(&due_task("p1", "https://example.com/a")).await.unwrap();
    store.create(&due_task("p2", "https://example.com/a")).await.unwrap();
    let mut failed = due_task("f1", "https://example.com/a");
    failed.status = TaskStatus::Failed;
    failed.retry_count = 1;
    failed.next_retry_at = Some(Utc::now() + ChronoDuration::minutes(5));
    store.create(&failed).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 3);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn cleanup_removes_only_old_terminal_rows() {
    let store = TaskStore::new(fresh_pool("t_cleanup").await);

    let mut old_done = due_task("old-done", "https://example.com/a");
    old_done.status = TaskStatus::Completed;
    old_done.started_at = Some(Utc::now() - ChronoDuration::days(41));
    old_done.completed_at = Some(Utc::now() - ChronoDuration::days(40));
    store.create(&old_done).await.unwrap();

    let mut fresh_done = due_task("fresh-done", "https://example.com/a");
    fresh_done.status = TaskStatus::Completed;
    fresh_done.started_at = Some(Utc::now());
    fresh_done.completed_at = Some(Utc::now());
    store.create(&fresh_done).await.unwrap();

    store.create(&due_task("pending", "https://example.com/a")).await.unwrap();

    assert_eq!(store.cleanup_expired_data().await.unwrap(), 1);
    assert!(matches!(
        store.find_by_id(old_done.id).await,
        Err(TaskError::NotFound(_))
    ));
    assert!(store.find_by_id(fresh_done.id).await.is_ok());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn stale_processing_rows_are_reaped() {
    let store = TaskStore::new(fresh_pool("t_stale").await);

    let mut stranded = due_task("stranded", "https://example.com/a");
    stranded.status = TaskStatus::Processing;
    stranded.updated_at = Utc::now() - ChronoDuration::hours(1);
    stranded.worker_id = Some("worker-gone".to_string());
    store.create(&stranded).await.unwrap();

    let mut exhausted = due_task("exhausted", "https://example.com/a");
    exhausted.status = TaskStatus::Processing;
    exhausted.updated_at = Utc::now() - ChronoDuration::hours(1);
    exhausted.max_retries = 0;
    store.create(&exhausted).await.unwrap();

    let mut live = due_task("live", "https://example.com/a");
    live.status = TaskStatus::Processing;
    store.create(&live).await.unwrap();

    let recovery = store
        .recover_stale_tasks(Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(recovery.requeued, 1);
    assert_eq!(recovery.dead_lettered, 1);

    let requeued = store.find_by_id(stranded.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.worker_id.is_none());

    let dead = store.find_by_id(exhausted.id).await.unwrap();
    assert_eq!(dead.status, TaskStatus::DeadLettered);
    assert!(dead.error_message.is_some());

    let untouched = store.find_by_id(live.id).await.unwrap();
    assert_eq!(untouched.status, TaskStatus::Processing);
}
