//! Periodic maintenance and health tasks.
//!
//! The stall monitor is part of the queue's correctness story: it breaks
//! expired visibility leases so crashed workers cannot strand jobs, and it
//! bounds how often a single job may stall before being failed for good.
//! The queue monitor and the scheduler-lag probe are diagnostic only.

use crate::job_registry::JobRegistry;
use crate::schema::VariantStatus;
use crate::{storage, variants};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

/// Scheduling delay above which the lag probe complains.
const LAG_WARN_THRESHOLD: Duration = Duration::from_secs(1);

/// Sampling period of the lag probe.
const LAG_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// A record in `processing` for longer than this is considered stuck.
const STALE_PROCESSING_AGE_SECS: i64 = 900;

/// Breaks expired job leases and enforces the stall bound.
pub(crate) struct StallMonitor<Context> {
    pub(crate) pool: PgPool,
    pub(crate) context: Context,
    pub(crate) registry: Arc<JobRegistry<Context>>,
    pub(crate) lock_duration: Duration,
    pub(crate) stalled_interval: Duration,
    pub(crate) max_stalled_count: i32,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> StallMonitor<Context> {
    pub(crate) async fn run(mut self) {
        let mut ticker = interval(self.stalled_interval);
        // The first tick fires immediately; skip it so a fresh runner does
        // not sweep before workers had a chance to take leases.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(sweep_error) = self.sweep().await {
                error!("Stall sweep failed: {sweep_error}");
            }
        }
    }

    /// One pass: release every expired lease, then fail jobs that have
    /// stalled past the bound.
    async fn sweep(&self) -> Result<(), sqlx::Error> {
        let released =
            storage::release_expired_leases(&self.pool, self.lock_duration.as_secs_f64()).await?;

        for job in released {
            warn!(
                job.id = job.id,
                job.r#type = %job.job_type,
                stalled_count = job.stalled_count,
                "Job lease expired without progress"
            );

            if job.stalled_count > self.max_stalled_count {
                warn!(job.id = job.id, "Job stalled too often. Running final-failure handler…");
                if let Some(handlers) = self.registry.get(&job.job_type) {
                    handlers
                        .final_failure(
                            self.context.clone(),
                            job.data.clone(),
                            format!("job stalled {} times", job.stalled_count),
                        )
                        .await;
                }
                storage::delete_job(&self.pool, job.id).await?;
            }
        }

        Ok(())
    }
}

/// Periodically pings the queue broker and logs its health.
pub struct QueueMonitor {
    pool: PgPool,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueMonitor {
    /// Create a monitor pinging the broker every `interval`.
    pub fn new(pool: PgPool, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            interval,
            shutdown_rx,
        }
    }

    /// Run until shutdown, logging queue depth and retry pressure.
    pub async fn run(mut self) {
        let mut ticker = interval_stream(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match storage::queue_depth(&self.pool).await {
                Ok((total, in_flight)) => {
                    let retried = storage::retried_job_count(&self.pool).await.unwrap_or(0);
                    let failed = variants::count_by_status(&self.pool, VariantStatus::Failed)
                        .await
                        .unwrap_or(0);
                    info!(total, in_flight, retried, failed, "queue broker healthy");
                }
                Err(ping_error) => {
                    error!("queue broker ping failed: {ping_error}");
                }
            }

            match variants::find_stale_processing(&self.pool, STALE_PROCESSING_AGE_SECS).await {
                Ok(stale) if !stale.is_empty() => {
                    warn!(
                        count = stale.len(),
                        oldest = %stale[0].created_at,
                        "variant records stuck in processing"
                    );
                }
                Ok(_) => {}
                Err(scan_error) => {
                    debug!("stuck-record scan failed: {scan_error}");
                }
            }
        }
    }
}

fn interval_stream(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

/// Spawn the scheduler-lag probe: sample every 5 s, warn when the runtime
/// wakes us more than a second late. Diagnostic only.
pub fn spawn_lag_probe(mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let before = Instant::now();
            tokio::select! {
                _ = sleep(LAG_SAMPLE_INTERVAL) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let lag = before.elapsed().saturating_sub(LAG_SAMPLE_INTERVAL);
            if lag > LAG_WARN_THRESHOLD {
                warn!(lag_ms = lag.as_millis() as u64, "scheduler lag above threshold");
            } else {
                debug!(lag_ms = lag.as_millis() as u64, "scheduler lag sample");
            }
        }
    })
}
