//! The read-path state machine.
//!
//! Given a validated request the resolver decides between serving the
//! cached rendition, serving the original while a render is in flight, or
//! admitting a new render job. Deduplication under concurrency rests on
//! the unique record index: the losing insert observes `Conflict`, and the
//! resolver re-reads instead of erroring.

use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::background_job::{BackgroundJob, EnqueueOptions};
use crate::errors::ServiceError;
use crate::jobs::{RenderVariant, RENDER_BACKOFF_BASE};
use crate::keys;
use crate::object_store::{ObjectStore, StoreError};
use crate::schema::{VariantFormat, VariantStatus};
use crate::variants::{self, NewVariant};

/// How often a resolution is retried after losing an insert race. One
/// retry is enough: the winner's record is visible on the re-read.
const CONFLICT_RETRIES: usize = 2;

/// Construction parameters for [`VariantResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Logical bucket recorded on admitted records.
    pub bucket: String,
    /// Public base URL redirects are formed against.
    pub public_base_url: String,
    /// Attempt budget attached to admitted render jobs.
    pub job_max_attempts: i32,
}

/// Outcome of a resolution: which key to redirect to and whether the
/// rendition behind it is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Object-store key the client is redirected to.
    pub key: String,
    /// Whether the original is being served in place of the rendition.
    pub serving_original: bool,
    /// Whether the served key is final (immutable cache policy applies).
    pub ready: bool,
}

/// The read-path entry point shared by all HTTP handlers.
#[derive(Clone)]
pub struct VariantResolver {
    pool: PgPool,
    store: Arc<dyn ObjectStore>,
    config: ResolverConfig,
}

impl VariantResolver {
    /// Build a resolver over the shared pool and object store.
    pub fn new(pool: PgPool, store: Arc<dyn ObjectStore>, config: ResolverConfig) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    /// Resolve a variant request to a redirect target.
    ///
    /// With no dimensions the original is verified and served. Otherwise
    /// the record for `(image_id, width, height, format)` decides: `ready`
    /// serves the rendition, an in-flight record serves the original, and
    /// anything else admits a new render job.
    pub async fn resolve_variant(
        &self,
        image_id: &str,
        dimensions: Option<(i32, i32)>,
        format: Option<VariantFormat>,
        force_resize: bool,
    ) -> Result<Resolution, ServiceError> {
        keys::validate_image_id(image_id)?;

        let Some((width, height)) = dimensions else {
            self.head_original(image_id).await?;
            return Ok(Resolution {
                key: keys::original_key(image_id),
                serving_original: true,
                ready: true,
            });
        };

        let format = match format {
            Some(format) => format,
            None => infer_format(image_id)?,
        };

        if force_resize {
            self.displace(image_id, width, height, format).await;
        }

        let mut tries = CONFLICT_RETRIES;
        loop {
            match self.resolve_once(image_id, width, height, format).await {
                Err(ServiceError::Conflict) if tries > 0 => {
                    tries -= 1;
                    debug!(image_id, width, height, "lost admission race; re-reading");
                }
                other => return other,
            }
        }
    }

    async fn resolve_once(
        &self,
        image_id: &str,
        width: i32,
        height: i32,
        format: VariantFormat,
    ) -> Result<Resolution, ServiceError> {
        if let Some(record) =
            variants::find_by_dimensions(&self.pool, image_id, width, height, format).await?
        {
            match record.status {
                VariantStatus::Ready => {
                    return Ok(Resolution {
                        key: record.variant_key,
                        serving_original: false,
                        ready: true,
                    });
                }
                VariantStatus::Queued | VariantStatus::Processing => {
                    return Ok(Resolution {
                        key: record.original_key,
                        serving_original: true,
                        ready: false,
                    });
                }
                VariantStatus::Failed => {
                    // A spent record blocks the unique index; displace it
                    // so the admission below can insert afresh.
                    debug!(image_id, width, height, "displacing failed record before re-admission");
                    self.displace(image_id, width, height, format).await;
                }
            }
        }

        self.admit(image_id, width, height, format).await
    }

    /// Admission: verify the original, insert a `queued` record, enqueue
    /// the render job, and serve the original meanwhile.
    async fn admit(
        &self,
        image_id: &str,
        width: i32,
        height: i32,
        format: VariantFormat,
    ) -> Result<Resolution, ServiceError> {
        self.head_original(image_id).await?;

        let new = NewVariant {
            image_id: image_id.to_string(),
            width,
            height,
            format,
            original_key: keys::original_key(image_id),
            variant_key: keys::variant_key(image_id, width, height, format),
            bucket: self.config.bucket.clone(),
        };
        let record = variants::insert(&self.pool, &new).await?;

        let job = RenderVariant {
            image_id: record.image_id.clone(),
            width: record.width,
            height: record.height,
            original_key: record.original_key.clone(),
            variant_key: record.variant_key.clone(),
            record_id: record.id,
            format: record.format,
        };
        let token = keys::job_token(image_id, width, height, format, record.id);
        let options = EnqueueOptions::default()
            .with_job_id(token)
            .with_max_attempts(self.config.job_max_attempts)
            .with_backoff_base(RENDER_BACKOFF_BASE);
        job.enqueue_with_options(&self.pool, options).await?;

        info!(
            image_id,
            width, height, %format, record.id = %record.id,
            "admitted render job"
        );

        Ok(Resolution {
            key: record.original_key,
            serving_original: true,
            ready: false,
        })
    }

    /// Best-effort displacement of an existing rendition: drop the record
    /// and the stored object so the next admission starts clean. Failures
    /// are logged, never raised.
    async fn displace(&self, image_id: &str, width: i32, height: i32, format: VariantFormat) {
        if let Err(displace_error) =
            variants::delete_by_dimensions(&self.pool, image_id, width, height, format).await
        {
            warn!(image_id, %displace_error, "failed to delete displaced record");
        }

        let variant_key = keys::variant_key(image_id, width, height, format);
        if let Err(displace_error) = self.store.delete(&variant_key).await {
            warn!(%variant_key, %displace_error, "failed to delete displaced rendition");
        }
    }

    /// Delete variants matching the selector; always scoped to one image.
    ///
    /// The object-store batch delete runs first; if it fails the metadata
    /// records are left in place so a retry can finish the cleanup.
    pub async fn delete_image(
        &self,
        image_id: &str,
        dimensions: Option<(i32, i32)>,
        format: Option<VariantFormat>,
    ) -> Result<u64, ServiceError> {
        keys::validate_image_id(image_id)?;

        let records =
            variants::find_by_selector(&self.pool, image_id, dimensions, format).await?;
        if records.is_empty() {
            return Err(ServiceError::NotFound(image_id.to_string()));
        }

        let variant_keys: Vec<String> =
            records.iter().map(|r| r.variant_key.clone()).collect();
        self.store.delete_many(&variant_keys).await.map_err(|delete_error| {
            warn!(image_id, %delete_error, "batch delete of renditions failed");
            ServiceError::ObjectStore(delete_error.to_string())
        })?;

        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        let removed = variants::delete_by_ids(&self.pool, &ids).await?;
        info!(image_id, removed, "deleted image variants");
        Ok(removed)
    }

    /// Key of the original if it exists.
    pub async fn get_original(&self, image_id: &str) -> Result<String, ServiceError> {
        keys::validate_image_id(image_id)?;
        self.head_original(image_id).await?;
        Ok(keys::original_key(image_id))
    }

    /// Public URL for an object key.
    pub fn public_url(&self, key: &str) -> String {
        keys::public_url(&self.config.public_base_url, key)
    }

    async fn head_original(&self, image_id: &str) -> Result<(), ServiceError> {
        let original_key = keys::original_key(image_id);
        match self.store.head(&original_key).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(ServiceError::NotFound(image_id.to_string())),
            Err(head_error) => Err(ServiceError::ObjectStore(head_error.to_string())),
        }
    }
}

/// When no output format is requested, fall back to the original's own
/// extension; an original outside the supported set needs an explicit
/// `format` parameter.
fn infer_format(image_id: &str) -> Result<VariantFormat, ServiceError> {
    keys::extension(image_id)
        .and_then(|ext| ext.parse::<VariantFormat>().ok())
        .ok_or_else(|| {
            ServiceError::Validation(format!(
                "cannot derive an output format from `{image_id}`; pass ?format="
            ))
        })
}
