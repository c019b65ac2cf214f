mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use erp_fulfillment::{
    entities::{job, JobState},
    errors::ServiceError,
    message_queue::{JobContext, JobHandler, JobOptions, JobQueue, JobWorker, WorkerOptions},
};
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;

use common::TestApp;

/// Fails every attempt and remembers how often it ran and whether it was
/// told the retries were exhausted.
#[derive(Default)]
struct AlwaysFails {
    runs: AtomicUsize,
    exhausted: AtomicUsize,
}

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn handle(
        &self,
        _job: &job::Model,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, ServiceError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.progress(40).await;
        Err(ServiceError::InternalError("boom".into()))
    }

    async fn on_failed(&self, _job: &job::Model, _error: &ServiceError, exhausted: bool) {
        if exhausted {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Echo;

#[async_trait]
impl JobHandler for Echo {
    async fn handle(
        &self,
        job: &job::Model,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, ServiceError> {
        ctx.progress(100).await;
        Ok(json!({ "echo": job.payload.clone() }))
    }
}

fn queue(app: &TestApp, name: &str) -> JobQueue {
    JobQueue::new(app.state.db.clone(), name)
}

/// Makes a delayed job runnable immediately.
async fn expire_backoff(app: &TestApp, queue: &JobQueue, job_id: &str) {
    let job = queue.get_job(job_id).await.unwrap().unwrap();
    let mut active: job::ActiveModel = job.into();
    active.run_at = Set(Utc::now() - chrono::Duration::seconds(1));
    active.update(&*app.state.db).await.unwrap();
}

#[tokio::test]
async fn enqueue_with_same_id_is_deduplicated() {
    let app = TestApp::new().await;
    let q = queue(&app, "dedup");
    let opts = JobOptions {
        job_id: Some("order-42".into()),
        ..Default::default()
    };

    let first = q.enqueue("work", &json!({"n": 1}), opts.clone()).await.unwrap();
    let second = q.enqueue("work", &json!({"n": 2}), opts).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.payload, json!({"n": 1}));
    assert_eq!(q.counts().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn a_claimed_job_cannot_be_claimed_again() {
    let app = TestApp::new().await;
    let q = queue(&app, "claims");
    q.enqueue("work", &json!({}), JobOptions::default())
        .await
        .unwrap();

    let claimed = q.claim_next().await.unwrap().expect("job available");
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempts_made, 1);
    assert!(q.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn lower_priority_value_runs_first() {
    let app = TestApp::new().await;
    let q = queue(&app, "priority");
    q.enqueue(
        "later",
        &json!({}),
        JobOptions {
            job_id: Some("later".into()),
            priority: 5,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    q.enqueue(
        "sooner",
        &json!({}),
        JobOptions {
            job_id: Some("sooner".into()),
            priority: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let claimed = q.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, "sooner");
}

#[tokio::test]
async fn failures_back_off_then_exhaust() {
    let app = TestApp::new().await;
    let q = queue(&app, "retries");
    let handler = AlwaysFails::default();
    let options = WorkerOptions::default();
    q.enqueue(
        "work",
        &json!({}),
        JobOptions {
            job_id: Some("flaky".into()),
            attempts: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(JobWorker::run_once(&q, &handler, &options).await.unwrap());
    let job = q.get_job("flaky").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.last_error.as_deref(), Some("Internal error: boom"));
    assert!(job.run_at > Utc::now());
    assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);

    expire_backoff(&app, &q, "flaky").await;
    assert!(JobWorker::run_once(&q, &handler, &options).await.unwrap());
    let job = q.get_job("flaky").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 2);
    assert!(job.finished_at.is_some());

    assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
    assert!(!JobWorker::run_once(&q, &handler, &options).await.unwrap());
}

#[tokio::test]
async fn completed_jobs_store_their_result_and_are_pruned() {
    let app = TestApp::new().await;
    let q = queue(&app, "results");
    let options = WorkerOptions {
        remove_on_complete: 1,
        ..Default::default()
    };
    for n in 0..3 {
        q.enqueue(
            "echo",
            &json!({ "n": n }),
            JobOptions {
                job_id: Some(format!("echo-{}", n)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    while JobWorker::run_once(&q, &Echo, &options).await.unwrap() {}

    let counts = q.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 0);
    assert!(q.get_job("echo-0").await.unwrap().is_none());
}

#[tokio::test]
async fn workers_drain_the_queue_and_stop_on_shutdown() {
    let app = TestApp::new().await;
    let q = queue(&app, "spawned");
    q.enqueue(
        "echo",
        &json!({"n": 1}),
        JobOptions {
            job_id: Some("spawned-1".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handles = JobWorker::spawn(
        q.clone(),
        Arc::new(Echo),
        WorkerOptions {
            concurrency: 1,
            poll_interval: std::time::Duration::from_millis(20),
            ..Default::default()
        },
        rx,
    );

    let mut done = false;
    for _ in 0..100 {
        if let Some(job) = q.get_job("spawned-1").await.unwrap() {
            if job.state == JobState::Completed {
                done = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(done, "worker should complete the job");

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("worker stops after shutdown")
            .unwrap();
    }
}

struct Explodes;

#[async_trait]
impl JobHandler for Explodes {
    async fn handle(
        &self,
        _job: &job::Model,
        _ctx: &JobContext,
    ) -> Result<serde_json::Value, ServiceError> {
        panic!("handler exploded");
    }
}

#[tokio::test]
async fn abandoned_active_job_is_picked_up_again() {
    let app = TestApp::new().await;
    let q = queue(&app, "stalled");
    q.enqueue(
        "echo",
        &json!({"n": 1}),
        JobOptions {
            job_id: Some("stuck".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // A worker claims the job and dies without reporting back.
    let claimed = q.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Active);

    // Still within its lease: nobody else may run it.
    assert!(!JobWorker::run_once(&q, &Echo, &WorkerOptions::default())
        .await
        .unwrap());
    assert_eq!(
        q.get_job("stuck").await.unwrap().unwrap().state,
        JobState::Active
    );

    let expired_lease = WorkerOptions {
        stall_timeout: std::time::Duration::ZERO,
        ..Default::default()
    };
    assert!(JobWorker::run_once(&q, &Echo, &expired_lease).await.unwrap());

    let job = q.get_job("stuck").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);
}

#[tokio::test]
async fn stalled_job_without_attempts_left_is_failed() {
    let app = TestApp::new().await;
    let q = queue(&app, "stalled-out");
    q.enqueue(
        "echo",
        &json!({}),
        JobOptions {
            job_id: Some("last-try".into()),
            attempts: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    q.claim_next().await.unwrap().unwrap();

    assert_eq!(q.recover_stalled(std::time::Duration::ZERO).await.unwrap(), 1);

    let job = q.get_job("last-try").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.finished_at.is_some());
    assert!(job.last_error.unwrap().starts_with("Job stalled"));
    assert!(q.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn panicking_handler_counts_as_a_failed_attempt() {
    let app = TestApp::new().await;
    let q = queue(&app, "panics");
    q.enqueue(
        "explode",
        &json!({}),
        JobOptions {
            job_id: Some("kaboom".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(JobWorker::run_once(&q, &Explodes, &WorkerOptions::default())
        .await
        .unwrap());

    let job = q.get_job("kaboom").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts_made, 1);
    assert!(job
        .last_error
        .unwrap()
        .contains("Job handler panicked: handler exploded"));
}
