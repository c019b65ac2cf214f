/*!
 * # Durable Job Queue
 *
 * Jobs live in the `jobs` table so they survive restarts. Workers claim a
 * job with a conditional update, run it through a [`JobHandler`], and either
 * complete it or schedule a retry with exponential backoff until
 * `max_attempts` is reached.
 *
 * A job left `active` longer than the stall timeout (its worker crashed or
 * lost track of it) is put back for another attempt, or failed once its
 * attempts are used up.
 */

use crate::db::DbPool;
use crate::entities::job::{self, Entity as JobEntity};
use crate::entities::JobState;
use crate::errors::ServiceError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use metrics::{counter, histogram};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Claim attempts per poll before yielding to the next tick.
const MAX_CLAIM_RACES: usize = 5;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Job {0} not found")]
    JobNotFound(String),
    #[error("Job {0} is not active")]
    NotActive(String),
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Database(db) => ServiceError::DatabaseError(db),
            QueueError::JobNotFound(id) => ServiceError::NotFound(format!("Job {} not found", id)),
            other => ServiceError::QueueError(other.to_string()),
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Caller-chosen id; a second enqueue with the same id is a no-op.
    pub job_id: Option<String>,
    /// Lower runs first.
    pub priority: i32,
    pub attempts: i32,
    pub backoff_base_ms: i64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            priority: 0,
            attempts: 3,
            backoff_base_ms: 2000,
        }
    }
}

/// Snapshot of job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Delay before retry number `attempts_made` (1-based): base, 2x base, 4x base, ...
pub fn backoff_delay(backoff_base_ms: i64, attempts_made: i32) -> ChronoDuration {
    let exponent = attempts_made.saturating_sub(1).clamp(0, 30) as u32;
    ChronoDuration::milliseconds(backoff_base_ms.max(0).saturating_mul(2i64.saturating_pow(exponent)))
}

/// Handle to one named queue in the `jobs` table.
#[derive(Clone, Debug)]
pub struct JobQueue {
    db: Arc<DbPool>,
    name: String,
}

impl JobQueue {
    pub fn new(db: Arc<DbPool>, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a job using the given connection, so callers can enqueue inside
    /// their own transaction. Returns the existing row when the id is taken.
    #[instrument(skip(self, conn, payload, opts), fields(queue = %self.name, job_name = %job_name))]
    pub async fn add<C, T>(
        &self,
        conn: &C,
        job_name: &str,
        payload: &T,
        opts: JobOptions,
    ) -> Result<job::Model, QueueError>
    where
        C: ConnectionTrait,
        T: Serialize + ?Sized,
    {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = JobEntity::find_by_id(id.clone()).one(conn).await? {
            debug!(job_id = %id, state = %existing.state, "job already enqueued");
            return Ok(existing);
        }

        let now = Utc::now();
        let model = job::ActiveModel {
            id: Set(id.clone()),
            queue: Set(self.name.clone()),
            name: Set(job_name.to_string()),
            payload: Set(serde_json::to_value(payload)?),
            priority: Set(opts.priority),
            state: Set(JobState::Waiting),
            progress: Set(0),
            attempts_made: Set(0),
            max_attempts: Set(opts.attempts.max(1)),
            backoff_base_ms: Set(opts.backoff_base_ms),
            run_at: Set(now),
            last_error: Set(None),
            return_value: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            started_at: Set(None),
            finished_at: Set(None),
        }
        .insert(conn)
        .await?;

        counter!("erp_jobs_enqueued_total", 1, "queue" => self.name.clone());
        info!(job_id = %id, "job enqueued");
        Ok(model)
    }

    /// Adds a job on the queue's own connection.
    pub async fn enqueue<T>(
        &self,
        job_name: &str,
        payload: &T,
        opts: JobOptions,
    ) -> Result<job::Model, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let db = self.db.clone();
        self.add(db.as_ref(), job_name, payload, opts).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<job::Model>, QueueError> {
        Ok(JobEntity::find_by_id(job_id.to_string())
            .one(self.db.as_ref())
            .await?)
    }

    /// Moves the next runnable job to `active` and returns it.
    ///
    /// The state guard on the update makes the claim atomic: when two workers
    /// race for the same row only one sees `rows_affected == 1`.
    pub async fn claim_next(&self) -> Result<Option<job::Model>, QueueError> {
        let db = self.db.as_ref();

        for _ in 0..MAX_CLAIM_RACES {
            let now = Utc::now();
            let candidate = JobEntity::find()
                .filter(job::Column::Queue.eq(self.name.clone()))
                .filter(job::Column::State.is_in([JobState::Waiting, JobState::Delayed]))
                .filter(job::Column::RunAt.lte(now))
                .order_by_asc(job::Column::Priority)
                .order_by_asc(job::Column::RunAt)
                .order_by_asc(job::Column::CreatedAt)
                .one(db)
                .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let claimed = JobEntity::update_many()
                .col_expr(job::Column::State, Expr::value(JobState::Active))
                .col_expr(
                    job::Column::AttemptsMade,
                    Expr::col(job::Column::AttemptsMade).add(1),
                )
                .col_expr(job::Column::StartedAt, Expr::value(now))
                .col_expr(job::Column::UpdatedAt, Expr::value(now))
                .filter(job::Column::Id.eq(candidate.id.clone()))
                .filter(job::Column::State.is_in([JobState::Waiting, JobState::Delayed]))
                .exec(db)
                .await?;

            if claimed.rows_affected == 1 {
                return self.get_job(&candidate.id).await;
            }
            debug!(job_id = %candidate.id, "lost claim race, retrying");
        }

        Ok(None)
    }

    /// Releases jobs that have been `active` since before `now - stall_timeout`.
    ///
    /// The stalled run already counted as an attempt when it was claimed, so
    /// jobs with attempts left become runnable again right away and the rest
    /// are failed. Returns the number of jobs released.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn recover_stalled(&self, stall_timeout: Duration) -> Result<u64, QueueError> {
        let db = self.db.as_ref();
        let now = Utc::now();
        let cutoff = now
            - ChronoDuration::from_std(stall_timeout).unwrap_or_else(|_| ChronoDuration::days(365));
        let reason = format!("Job stalled: no result after {}s", stall_timeout.as_secs());

        let retried = JobEntity::update_many()
            .col_expr(job::Column::State, Expr::value(JobState::Delayed))
            .col_expr(job::Column::RunAt, Expr::value(now))
            .col_expr(job::Column::LastError, Expr::value(reason.clone()))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Queue.eq(self.name.clone()))
            .filter(job::Column::State.eq(JobState::Active))
            .filter(job::Column::StartedAt.lte(cutoff))
            .filter(Expr::col(job::Column::AttemptsMade).lt(Expr::col(job::Column::MaxAttempts)))
            .exec(db)
            .await?;

        let failed = JobEntity::update_many()
            .col_expr(job::Column::State, Expr::value(JobState::Failed))
            .col_expr(job::Column::LastError, Expr::value(reason))
            .col_expr(job::Column::FinishedAt, Expr::value(now))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Queue.eq(self.name.clone()))
            .filter(job::Column::State.eq(JobState::Active))
            .filter(job::Column::StartedAt.lte(cutoff))
            .exec(db)
            .await?;

        let released = retried.rows_affected + failed.rows_affected;
        if released > 0 {
            counter!("erp_jobs_stalled_total", released, "queue" => self.name.clone());
            warn!(
                retried = retried.rows_affected,
                failed = failed.rows_affected,
                "released stalled jobs"
            );
        }
        Ok(released)
    }

    pub async fn update_progress(&self, job_id: &str, progress: i32) -> Result<(), QueueError> {
        let res = JobEntity::update_many()
            .col_expr(job::Column::Progress, Expr::value(progress.clamp(0, 100)))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Id.eq(job_id))
            .exec(self.db.as_ref())
            .await?;
        if res.rows_affected == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn complete(
        &self,
        job_id: &str,
        return_value: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let res = JobEntity::update_many()
            .col_expr(job::Column::State, Expr::value(JobState::Completed))
            .col_expr(job::Column::ReturnValue, Expr::value(return_value))
            .col_expr(job::Column::FinishedAt, Expr::value(now))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::State.eq(JobState::Active))
            .exec(self.db.as_ref())
            .await?;
        if res.rows_affected == 0 {
            return Err(QueueError::NotActive(job_id.to_string()));
        }
        Ok(())
    }

    /// Records a failed attempt. Returns `Delayed` when a retry was scheduled
    /// and `Failed` once the attempts are used up.
    pub async fn fail(&self, job_id: &str, reason: &str) -> Result<JobState, QueueError> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(job_id.to_string()));
        }

        let now = Utc::now();
        let next_state = if job.attempts_made < job.max_attempts {
            JobState::Delayed
        } else {
            JobState::Failed
        };

        let mut update = JobEntity::update_many()
            .col_expr(job::Column::State, Expr::value(next_state))
            .col_expr(job::Column::LastError, Expr::value(reason.to_string()))
            .col_expr(job::Column::UpdatedAt, Expr::value(now));

        update = match next_state {
            JobState::Delayed => update.col_expr(
                job::Column::RunAt,
                Expr::value(now + backoff_delay(job.backoff_base_ms, job.attempts_made)),
            ),
            _ => update.col_expr(job::Column::FinishedAt, Expr::value(now)),
        };

        update
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::State.eq(JobState::Active))
            .exec(self.db.as_ref())
            .await?;

        Ok(next_state)
    }

    /// Keeps only the newest `keep_completed` completed and `keep_failed`
    /// failed jobs. Returns the number of rows removed.
    pub async fn prune(&self, keep_completed: u64, keep_failed: u64) -> Result<u64, QueueError> {
        let mut removed = 0;
        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let ids: Vec<String> = JobEntity::find()
                .select_only()
                .column(job::Column::Id)
                .filter(job::Column::Queue.eq(self.name.clone()))
                .filter(job::Column::State.eq(state))
                .order_by_desc(job::Column::FinishedAt)
                .order_by_desc(job::Column::UpdatedAt)
                .into_tuple()
                .all(self.db.as_ref())
                .await?;

            let stale: Vec<String> = ids.into_iter().skip(keep as usize).collect();
            if stale.is_empty() {
                continue;
            }
            let res = JobEntity::delete_many()
                .filter(job::Column::Id.is_in(stale))
                .exec(self.db.as_ref())
                .await?;
            removed += res.rows_affected;
        }
        if removed > 0 {
            debug!(queue = %self.name, removed, "pruned finished jobs");
        }
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut counts = JobCounts::default();
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Completed,
            JobState::Failed,
        ] {
            let n = JobEntity::find()
                .filter(job::Column::Queue.eq(self.name.clone()))
                .filter(job::Column::State.eq(state))
                .count(self.db.as_ref())
                .await?;
            match state {
                JobState::Waiting => counts.waiting = n,
                JobState::Active => counts.active = n,
                JobState::Delayed => counts.delayed = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

/// Handle given to a running job for progress reporting.
#[derive(Clone, Debug)]
pub struct JobContext {
    queue: JobQueue,
    job_id: String,
}

impl JobContext {
    pub fn new(queue: JobQueue, job_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Best-effort; a failed progress write never fails the job.
    pub async fn progress(&self, value: i32) {
        if let Err(e) = self.queue.update_progress(&self.job_id, value).await {
            warn!(job_id = %self.job_id, error = %e, "failed to record job progress");
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Runs one claimed job. The returned value is stored as the job result.
    async fn handle(
        &self,
        job: &job::Model,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, ServiceError>;

    /// Called after every failed attempt with whether retries are exhausted.
    async fn on_failed(&self, _job: &job::Model, _error: &ServiceError, _exhausted: bool) {}
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub remove_on_complete: u64,
    pub remove_on_fail: u64,
    /// How long a job may stay `active` before it is treated as abandoned.
    pub stall_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            remove_on_complete: 100,
            remove_on_fail: 50,
            stall_timeout: Duration::from_secs(300),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub struct JobWorker;

impl JobWorker {
    /// Starts `concurrency` polling loops that stop once `shutdown` flips to true.
    pub fn spawn<H: JobHandler>(
        queue: JobQueue,
        handler: Arc<H>,
        options: WorkerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!(
            queue = %queue.name(),
            concurrency = options.concurrency,
            "starting job workers"
        );

        (0..options.concurrency.max(1))
            .map(|worker_id| {
                let queue = queue.clone();
                let handler = handler.clone();
                let options = options.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match Self::run_once(&queue, handler.as_ref(), &options).await {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => error!(worker_id, error = %e, "job worker poll failed"),
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(options.poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    info!(worker_id, queue = %queue.name(), "job worker stopped");
                })
            })
            .collect()
    }

    /// Claims and runs at most one job. Returns whether a job was processed.
    ///
    /// A panicking handler counts as a failed attempt.
    pub async fn run_once<H: JobHandler + ?Sized>(
        queue: &JobQueue,
        handler: &H,
        options: &WorkerOptions,
    ) -> Result<bool, QueueError> {
        queue.recover_stalled(options.stall_timeout).await?;
        let Some(job) = queue.claim_next().await? else {
            return Ok(false);
        };

        let ctx = JobContext::new(queue.clone(), job.id.clone());
        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(&job, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                error!(job_id = %job.id, panic = %message, "job handler panicked");
                Err(ServiceError::InternalError(format!(
                    "Job handler panicked: {}",
                    message
                )))
            });
        histogram!("erp_job_duration_seconds", started.elapsed().as_secs_f64());

        match outcome {
            Ok(value) => {
                queue.complete(&job.id, Some(value)).await?;
                counter!("erp_jobs_completed_total", 1, "queue" => queue.name().to_string());
                info!(job_id = %job.id, attempt = job.attempts_made, "job completed");
            }
            Err(err) => {
                let state = queue.fail(&job.id, &err.to_string()).await?;
                let exhausted = state == JobState::Failed;
                counter!("erp_jobs_failed_total", 1, "queue" => queue.name().to_string());
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    exhausted,
                    error = %err,
                    "job attempt failed"
                );
                handler.on_failed(&job, &err, exhausted).await;
            }
        }

        queue
            .prune(options.remove_on_complete, options.remove_on_fail)
            .await?;
        Ok(true)
    }
}
