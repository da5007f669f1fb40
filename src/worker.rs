use crate::background_job::Progress;
use crate::errors::ServiceError;
use crate::job_registry::JobRegistry;
use crate::storage;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info_span, trace, warn, Instrument};

pub(crate) struct Worker<Context> {
    pub(crate) pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) name: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) lock_duration: Duration,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Claim and run jobs until shut down, or until the queue drains if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(mut self) {
        loop {
            if self.is_shutting_down() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("Queue drained. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable job found. Polling again in {sleep_duration:?}…");
                    tokio::select! {
                        _ = sleep(sleep_duration) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Err(error) => {
                    error!("Failed to run job: {error:#}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next eligible job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if nothing was claimable
    /// - `Err(...)` if claiming or settling the job failed
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let job_types = self.job_registry.job_types();

        trace!("Looking for the next background job…");
        let job = match storage::claim_next_job(
            &self.pool,
            &job_types,
            &self.name,
            self.lock_duration.as_secs_f64(),
        )
        .await?
        {
            Some(job) => job,
            None => return Ok(None),
        };

        let span = info_span!("job", job.id = %job.id, job.r#type = %job.job_type);
        let job_id = job.id;

        let handlers = self
            .job_registry
            .get(&job.job_type)
            .ok_or_else(|| anyhow!("Unknown job type {}", job.job_type))?;

        debug!(parent: &span, worker = %self.name, attempt = job.attempts + 1, "Job active…");

        let progress = Progress::new(self.pool.clone(), job_id);
        let future = handlers.run(self.context.clone(), job.data.clone(), progress);

        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .instrument(span.clone())
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            .and_then(std::convert::identity);

        let _enter = span.enter();
        match result {
            Ok(()) => {
                debug!("Job completed. Removing it from the queue…");
                storage::delete_job(&self.pool, job_id).await?;
            }
            Err(job_error) => {
                warn!("Failed to run job: {job_error:#}");

                let terminal = job_error
                    .downcast_ref::<ServiceError>()
                    .is_some_and(ServiceError::is_terminal);

                let attempts =
                    storage::record_failure(&self.pool, job_id, &format!("{job_error:#}")).await?;

                if terminal || attempts >= job.max_attempts {
                    warn!(
                        attempts,
                        terminal, "Job failed for good. Running final-failure handler…"
                    );
                    handlers
                        .final_failure(
                            self.context.clone(),
                            job.data.clone(),
                            job_error.to_string(),
                        )
                        .await;
                    storage::delete_job(&self.pool, job_id).await?;
                }
            }
        }

        Ok(Some(job_id))
    }
}
