use crate::job_registry::JobRegistry;
use crate::monitor::StallMonitor;
use crate::worker::Worker;
use crate::BackgroundJob;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

const DEFAULT_NUM_WORKERS: usize = 2;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_STALLED_COUNT: i32 = 2;

/// Marker type for a runner with at least one registered job type.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;

/// Marker type for a runner with no registered job types.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Orchestrates the worker tasks and the stall monitor for the job queue.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    pool: PgPool,
    context: Context,
    registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    lock_duration: Duration,
    stalled_interval: Duration,
    max_stalled_count: i32,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.registry.job_types())
            .field("num_workers", &self.num_workers)
            .field("lock_duration", &self.lock_duration)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(pool: PgPool, context: Context) -> Self {
        Self {
            pool,
            context,
            registry: JobRegistry::default(),
            num_workers: DEFAULT_NUM_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lock_duration: DEFAULT_LOCK_DURATION,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// poll for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the visibility-lease duration. Must comfortably exceed the
    /// wall-clock budget of a single job, or healthy jobs will be counted
    /// as stalled.
    pub fn lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Set how often the stall monitor scans for expired leases.
    pub fn stalled_interval(mut self, stalled_interval: Duration) -> Self {
        self.stalled_interval = stalled_interval;
        self
    }

    /// Set how many broken leases a job may accumulate before it is routed
    /// to its final-failure handler.
    pub fn max_stalled_count(mut self, max_stalled_count: i32) -> Self {
        self.max_stalled_count = max_stalled_count;
        self
    }

    /// Shut the workers down once the queue has no claimable jobs left.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Register a job type with this runner.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.registry.register::<J>();
        Runner {
            pool: self.pool,
            context: self.context,
            registry: self.registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            lock_duration: self.lock_duration,
            stalled_interval: self.stalled_interval,
            max_stalled_count: self.max_stalled_count,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the workers and the stall monitor.
    ///
    /// Returns a [`RunHandle`] used to request shutdown and to wait for the
    /// workers to finish.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(self.registry.clone());

        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("renditions-worker-{}-{i}", std::process::id());
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                pool: self.pool.clone(),
                context: self.context.clone(),
                job_registry: registry.clone(),
                name: name.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                lock_duration: self.lock_duration,
                shutdown_rx: shutdown_rx.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            handles.push(tokio::spawn(worker.run().instrument(span)));
        }

        let monitor = StallMonitor {
            pool: self.pool.clone(),
            context: self.context.clone(),
            registry,
            lock_duration: self.lock_duration,
            stalled_interval: self.stalled_interval,
            max_stalled_count: self.max_stalled_count,
            shutdown_rx,
        };
        let monitor_handle = tokio::spawn(
            monitor
                .run()
                .instrument(info_span!("stall_monitor")),
        );

        RunHandle {
            handles,
            monitor_handle,
            shutdown_tx,
        }
    }
}

/// Handle to a running background job processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    monitor_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunHandle {
    /// Ask workers to stop claiming new jobs. In-flight jobs finish first.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all workers to shut down, then stop the stall monitor.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
        self.monitor_handle.abort();
    }
}
