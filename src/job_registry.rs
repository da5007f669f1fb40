use crate::background_job::{BackgroundJob, Progress};
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value, Progress) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type FinalFailureFn<Context> =
    Arc<dyn Fn(Context, Value, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatch entry for one registered job type.
pub(crate) struct JobHandlers<Context> {
    run: RunTaskFn<Context>,
    final_failure: FinalFailureFn<Context>,
}

impl<Context> Clone for JobHandlers<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            final_failure: self.final_failure.clone(),
        }
    }
}

impl<Context> JobHandlers<Context> {
    pub(crate) fn run(
        &self,
        ctx: Context,
        data: Value,
        progress: Progress,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.run)(ctx, data, progress)
    }

    pub(crate) fn final_failure(
        &self,
        ctx: Context,
        data: Value,
        error: String,
    ) -> BoxFuture<'static, ()> {
        (self.final_failure)(ctx, data, error)
    }
}

/// Maps job type names to their deserialization + dispatch closures.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, JobHandlers<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = Arc::new(|ctx, data, progress| {
            async move {
                let job: J = serde_json::from_value(data)
                    .map_err(|err| anyhow!("failed to deserialize {} job: {err}", J::JOB_TYPE))?;
                job.run(ctx, progress).await
            }
            .boxed()
        });

        let final_failure: FinalFailureFn<Context> = Arc::new(|ctx, data, error| {
            async move {
                match serde_json::from_value::<J>(data) {
                    Ok(job) => job.on_final_failure(ctx, error).await,
                    Err(err) => {
                        warn!(job.r#type = J::JOB_TYPE, %err,
                            "cannot run final-failure handler for undecodable payload");
                    }
                }
            }
            .boxed()
        });

        self.entries
            .insert(J::JOB_TYPE.to_owned(), JobHandlers { run, final_failure });
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&JobHandlers<Context>> {
        self.entries.get(job_type)
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
