//! The render job: drives a variant record from `queued` to `ready`.
//!
//! Every pipeline step runs under its own wall-clock budget; a breached
//! budget fails the step with a `Timeout` and the queue reschedules the
//! job under backoff. Exhausted jobs land in the final-failure handler,
//! which implements the bounded requeue policy: the per-attempt counter is
//! reset by a requeue, so the outer `requeue_count` bounds how many full
//! retry cycles a single rendition may trigger.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background_job::{BackgroundJob, EnqueueOptions, Progress};
use crate::errors::ServiceError;
use crate::keys;
use crate::object_store::{ObjectStore, PutOptions};
use crate::render;
use crate::schema::VariantFormat;
use crate::{storage, variants};

/// Cache policy for immutable renditions, applied both to uploads and to
/// redirects pointing at a ready rendition.
pub const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Backoff base used for render jobs, overriding the queue default.
pub const RENDER_BACKOFF_BASE: Duration = Duration::from_secs(5);

const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
const RECORD_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const RENDER_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const ANNOTATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state handed to running render jobs.
#[derive(Clone)]
pub struct WorkerContext {
    /// Metadata store and queue broker.
    pub pool: PgPool,
    /// Object store holding originals and renditions.
    pub store: Arc<dyn ObjectStore>,
    /// Bound on full retry cycles per record.
    pub max_requeues: i32,
    /// Attempt budget for requeued jobs.
    pub job_max_attempts: i32,
}

impl WorkerContext {
    /// Build a context with the default attempt budget.
    pub fn new(pool: PgPool, store: Arc<dyn ObjectStore>, max_requeues: i32) -> Self {
        Self {
            pool,
            store,
            max_requeues,
            job_max_attempts: crate::background_job::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the attempt budget used when this context requeues a job.
    pub fn with_job_max_attempts(mut self, job_max_attempts: i32) -> Self {
        self.job_max_attempts = job_max_attempts;
        self
    }
}

/// Payload of a render job. Field names follow the wire format shared with
/// the resolver's enqueue path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderVariant {
    /// Logical asset identifier.
    pub image_id: String,
    /// Target width.
    pub width: i32,
    /// Target height.
    pub height: i32,
    /// Key of the source asset.
    pub original_key: String,
    /// Key the rendition is uploaded under.
    pub variant_key: String,
    /// The variant record this job drives.
    pub record_id: Uuid,
    /// Target encoding.
    pub format: VariantFormat,
}

/// Wall-clock accounting across the pipeline, reported on completion.
#[derive(Debug, Default)]
struct StepTimings {
    metadata: Duration,
    download: Duration,
    render: Duration,
    upload: Duration,
}

impl StepTimings {
    fn log_summary(&self, variant_key: &str, file_size: i64) {
        let total = self.metadata + self.download + self.render + self.upload;
        let pct = |share: Duration| {
            if total.is_zero() {
                0u32
            } else {
                (share.as_secs_f64() / total.as_secs_f64() * 100.0).round() as u32
            }
        };
        info!(
            variant_key,
            file_size,
            total_ms = total.as_millis() as u64,
            metadata_pct = pct(self.metadata),
            store_pct = pct(self.download + self.upload),
            render_pct = pct(self.render),
            "rendition complete"
        );
    }
}

/// Race a pipeline step against its budget.
async fn step<T, F>(name: &'static str, budget: Duration, fut: F) -> Result<T, ServiceError>
where
    F: std::future::Future<Output = Result<T, ServiceError>>,
{
    match timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout {
            step: name,
            seconds: budget.as_secs(),
        }),
    }
}

impl RenderVariant {
    async fn pipeline(
        &self,
        ctx: &WorkerContext,
        progress: &Progress,
    ) -> Result<(), ServiceError> {
        let mut timings = StepTimings::default();

        // Metadata connectivity: fail fast before taking any real work.
        let clock = Instant::now();
        step("metadata-connectivity", CONNECTIVITY_TIMEOUT, async {
            ctx.pool.acquire().await.map(drop).map_err(ServiceError::from)
        })
        .await?;
        progress.report(5).await;

        // The record must exist; without it no retry can ever succeed.
        let record = step(
            "load-record",
            RECORD_TIMEOUT,
            variants::find_by_id(&ctx.pool, self.record_id),
        )
        .await?
        .ok_or(ServiceError::RecordMissing)?;
        progress.report(10).await;

        step(
            "mark-processing",
            RECORD_TIMEOUT,
            variants::mark_processing(&ctx.pool, self.record_id),
        )
        .await?
        .ok_or(ServiceError::RecordMissing)?;
        timings.metadata += clock.elapsed();
        progress.report(20).await;

        let clock = Instant::now();
        let original = step("download-original", DOWNLOAD_TIMEOUT, async {
            match ctx.store.get(&self.original_key).await {
                Ok(bytes) if bytes.is_empty() => Err(ServiceError::SourceUnavailable(format!(
                    "empty body for `{}`",
                    self.original_key
                ))),
                Ok(bytes) => Ok(bytes),
                Err(err) => Err(ServiceError::SourceUnavailable(err.to_string())),
            }
        })
        .await?;
        timings.download = clock.elapsed();
        progress.report(50).await;

        let clock = Instant::now();
        let (width, height, format) = (record.width as u32, record.height as u32, record.format);
        let rendered = step("render", RENDER_TIMEOUT, async {
            tokio::task::spawn_blocking(move || {
                render::render_cover(&original, width, height, format)
            })
            .await
            .map_err(|err| ServiceError::Render(format!("render task died: {err}")))?
        })
        .await?;
        timings.render = clock.elapsed();
        progress.report(75).await;

        let clock = Instant::now();
        let content_type = render::sniff_content_type(&rendered);
        let file_size = rendered.len() as i64;
        step("upload-variant", UPLOAD_TIMEOUT, async {
            ctx.store
                .put(
                    &self.variant_key,
                    Bytes::from(rendered),
                    PutOptions {
                        content_type: content_type.to_string(),
                        cache_control: CACHE_CONTROL_IMMUTABLE.to_string(),
                    },
                )
                .await
                .map_err(|err| ServiceError::Upload(err.to_string()))
        })
        .await?;
        timings.upload = clock.elapsed();
        progress.report(90).await;

        let clock = Instant::now();
        step(
            "mark-ready",
            RECORD_TIMEOUT,
            variants::mark_ready(&ctx.pool, self.record_id, file_size),
        )
        .await?
        .ok_or(ServiceError::RecordMissing)?;
        timings.metadata += clock.elapsed();
        progress.report(100).await;

        timings.log_summary(&self.variant_key, file_size);
        Ok(())
    }

    /// Best-effort `failed` annotation before the error goes back to the
    /// queue. Never masks the original error.
    async fn annotate_failure(&self, ctx: &WorkerContext, pipeline_error: &ServiceError) {
        let reason = pipeline_error.to_string();
        match timeout(
            ANNOTATE_TIMEOUT,
            variants::mark_failed(&ctx.pool, self.record_id, &reason),
        )
        .await
        {
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => {
                debug!(record.id = %self.record_id, "record gone or already settled; skipping failure annotation");
            }
            Ok(Err(annotate_error)) => {
                warn!(record.id = %self.record_id, %annotate_error, "failed to annotate failure");
            }
            Err(_) => {
                warn!(record.id = %self.record_id, "failure annotation timed out");
            }
        }
    }

    /// The bounded requeue policy, run when all attempts are exhausted.
    async fn requeue(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let Some(record) = variants::find_by_id(&ctx.pool, self.record_id).await? else {
            debug!(record.id = %self.record_id, "record gone; nothing to requeue");
            return Ok(());
        };

        if record.requeue_count >= ctx.max_requeues {
            info!(
                record.id = %self.record_id,
                requeue_count = record.requeue_count,
                "requeue budget exhausted; record stays failed"
            );
            return Ok(());
        }

        let token = keys::job_token(
            &self.image_id,
            self.width,
            self.height,
            self.format,
            self.record_id,
        );
        let options = EnqueueOptions::default()
            .with_job_id(token)
            .with_max_attempts(ctx.job_max_attempts)
            .with_backoff_base(RENDER_BACKOFF_BASE);
        let enqueued = self.enqueue_with_options(&ctx.pool, options).await?;

        let reset = variants::requeue_failed(&ctx.pool, self.record_id, ctx.max_requeues).await?;
        match reset {
            Some(record) => {
                info!(
                    record.id = %self.record_id,
                    requeue_count = record.requeue_count,
                    "record requeued for another retry cycle"
                );
            }
            None => {
                // A concurrent handler hit the bound first; withdraw the
                // job we just enqueued.
                if let Some(job_row_id) = enqueued {
                    let _ = storage::delete_job(&ctx.pool, job_row_id).await;
                }
            }
        }

        Ok(())
    }
}

impl BackgroundJob for RenderVariant {
    const JOB_TYPE: &'static str = "render_variant";

    type Context = WorkerContext;

    async fn run(&self, ctx: Self::Context, progress: Progress) -> anyhow::Result<()> {
        match self.pipeline(&ctx, &progress).await {
            Ok(()) => Ok(()),
            Err(pipeline_error) => {
                self.annotate_failure(&ctx, &pipeline_error).await;
                Err(pipeline_error.into())
            }
        }
    }

    async fn on_final_failure(&self, ctx: Self::Context, error: String) {
        debug!(record.id = %self.record_id, %error, "render job failed for good");
        if let Err(requeue_error) = self.requeue(&ctx).await {
            warn!(record.id = %self.record_id, %requeue_error, "requeue policy failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_wire_format() {
        let job = RenderVariant {
            image_id: "pic.png".into(),
            width: 200,
            height: 100,
            original_key: "pic.png".into(),
            variant_key: "pic___200x100.webp".into(),
            record_id: Uuid::nil(),
            format: VariantFormat::Webp,
        };
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({
                "imageId": "pic.png",
                "width": 200,
                "height": 100,
                "originalKey": "pic.png",
                "variantKey": "pic___200x100.webp",
                "recordId": "00000000-0000-0000-0000-000000000000",
                "format": "webp",
            })
        );
    }

    #[test]
    fn payload_round_trips() {
        let job = RenderVariant {
            image_id: "pic.png".into(),
            width: 200,
            height: 100,
            original_key: "pic.png".into(),
            variant_key: "pic___200x100.webp".into(),
            record_id: Uuid::new_v4(),
            format: VariantFormat::Webp,
        };
        let parsed: RenderVariant =
            serde_json::from_value(serde_json::to_value(&job).unwrap()).unwrap();
        assert_eq!(parsed.record_id, job.record_id);
        assert_eq!(parsed.format, job.format);
    }
}
