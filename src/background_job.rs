use crate::errors::EnqueueError;
use crate::storage;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// Attempts granted to a job unless the enqueue overrides them.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Base delay of the exponential backoff between attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Per-enqueue knobs for retry policy and idempotency.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Idempotency token. A live job with the same token swallows the
    /// enqueue; completed jobs vacate their token on removal.
    pub job_id: Option<String>,
    /// Attempts before the final-failure handler runs.
    pub max_attempts: i32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl EnqueueOptions {
    /// Attach an idempotency token.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Override the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the backoff base delay.
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }
}

/// Progress reporter handed to a running job.
///
/// Reports are diagnostic: they are logged and persisted best-effort on
/// the job row, and never fail the job.
#[derive(Clone)]
pub struct Progress {
    pool: PgPool,
    job_row_id: i64,
}

impl Progress {
    pub(crate) fn new(pool: PgPool, job_row_id: i64) -> Self {
        Self { pool, job_row_id }
    }

    /// Report a completion percentage for the current job.
    pub async fn report(&self, percent: i16) {
        tracing::debug!(job.id = self.job_row_id, progress = percent, "job progress");
        storage::update_progress(&self.pool, self.job_row_id, percent).await;
    }
}

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Default priority; higher runs earlier.
    const PRIORITY: i16 = 0;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the job. Returning an error counts one attempt; the queue
    /// reschedules under backoff until attempts are exhausted.
    fn run(
        &self,
        ctx: Self::Context,
        progress: Progress,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Invoked exactly once when the job has exhausted its attempts (or
    /// failed terminally) and is about to leave the queue. Second-level
    /// policies such as bounded requeue cycles live here.
    fn on_final_failure(
        &self,
        ctx: Self::Context,
        error: String,
    ) -> impl Future<Output = ()> + Send {
        let _ = (ctx, error);
        async {}
    }

    /// Enqueue this job with default options.
    ///
    /// Returns the job ID if enqueued, or `None` if deduplicated.
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        self.enqueue_with_options(pool, EnqueueOptions::default())
    }

    /// Enqueue this job with explicit retry and idempotency options.
    #[instrument(name = "queue.enqueue", skip(self, pool, options), fields(message = Self::JOB_TYPE))]
    fn enqueue_with_options<'a>(
        &'a self,
        pool: &'a PgPool,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        async move {
            storage::enqueue_job(
                pool,
                Self::JOB_TYPE,
                data,
                options.job_id.as_deref(),
                Self::PRIORITY,
                options.max_attempts,
                options.backoff_base.as_millis() as i64,
            )
            .await
        }
        .boxed()
    }
}
