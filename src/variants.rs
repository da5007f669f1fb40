//! Repository for variant records.
//!
//! All state transitions are single conditional statements; a transition
//! whose precondition no longer holds returns `None` rather than clobbering
//! a newer state. The unique index on `(image_id, width, height, format)`
//! turns concurrent admissions into a `Conflict` the resolver recovers from.

use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::schema::{VariantFormat, VariantRecord, VariantStatus};

const COLUMNS: &str = "id, image_id, width, height, format, original_key, variant_key, bucket, \
     status, file_size, failed_reason, failed_at, requeue_count, completed_at, created_at";

/// Fields required to admit a new variant.
#[derive(Debug, Clone)]
pub struct NewVariant {
    /// Logical asset identifier.
    pub image_id: String,
    /// Target width.
    pub width: i32,
    /// Target height.
    pub height: i32,
    /// Target encoding.
    pub format: VariantFormat,
    /// Key of the source asset.
    pub original_key: String,
    /// Deterministic rendition key.
    pub variant_key: String,
    /// Logical bucket name.
    pub bucket: String,
}

/// Insert a `queued` record. A concurrent insert of the same quadruple
/// loses the unique-index race and surfaces as `Conflict`.
pub async fn insert(pool: &PgPool, new: &NewVariant) -> Result<VariantRecord, ServiceError> {
    let query = format!(
        "INSERT INTO image_variants \
           (id, image_id, width, height, format, original_key, variant_key, bucket, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued') \
         RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, VariantRecord>(&query)
        .bind(Uuid::new_v4())
        .bind(&new.image_id)
        .bind(new.width)
        .bind(new.height)
        .bind(new.format)
        .bind(&new.original_key)
        .bind(&new.variant_key)
        .bind(&new.bucket)
        .fetch_one(pool)
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db) if db.is_unique_violation() => ServiceError::Conflict,
            _ => ServiceError::Store(err),
        })
}

/// Look up a record by its key quadruple.
pub async fn find_by_dimensions(
    pool: &PgPool,
    image_id: &str,
    width: i32,
    height: i32,
    format: VariantFormat,
) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!(
        "SELECT {COLUMNS} FROM image_variants \
         WHERE image_id = $1 AND width = $2 AND height = $3 AND format = $4"
    );
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(image_id)
        .bind(width)
        .bind(height)
        .bind(format)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Look up a record by id.
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!("SELECT {COLUMNS} FROM image_variants WHERE id = $1");
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Move a record into `processing`. `ready` is terminal and is never
/// overwritten; a retried attempt may legitimately come from `failed`.
pub async fn mark_processing(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!(
        "UPDATE image_variants SET status = 'processing' \
         WHERE id = $1 AND status <> 'ready' \
         RETURNING {COLUMNS}"
    );
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Complete a record: `ready`, rendition size, completion timestamp.
pub async fn mark_ready(
    pool: &PgPool,
    id: Uuid,
    file_size: i64,
) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!(
        "UPDATE image_variants \
         SET status = 'ready', file_size = $2, completed_at = NOW(), \
             failed_reason = NULL, failed_at = NULL \
         WHERE id = $1 AND status = 'processing' \
         RETURNING {COLUMNS}"
    );
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(id)
        .bind(file_size)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Annotate a failed attempt. Never demotes `ready`.
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    reason: &str,
) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!(
        "UPDATE image_variants \
         SET status = 'failed', failed_reason = $2, failed_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'processing') \
         RETURNING {COLUMNS}"
    );
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(id)
        .bind(reason)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// Reset a `failed` record for another retry cycle. The `requeue_count`
/// guard makes the cycle bound atomic even under concurrent handlers.
pub async fn requeue_failed(
    pool: &PgPool,
    id: Uuid,
    max_requeues: i32,
) -> Result<Option<VariantRecord>, ServiceError> {
    let query = format!(
        "UPDATE image_variants \
         SET status = 'queued', failed_reason = NULL, failed_at = NULL, \
             requeue_count = requeue_count + 1 \
         WHERE id = $1 AND status = 'failed' AND requeue_count < $2 \
         RETURNING {COLUMNS}"
    );
    let record = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(id)
        .bind(max_requeues)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

/// All records matching a delete selector: image id plus optional
/// dimensions and format.
pub async fn find_by_selector(
    pool: &PgPool,
    image_id: &str,
    dimensions: Option<(i32, i32)>,
    format: Option<VariantFormat>,
) -> Result<Vec<VariantRecord>, ServiceError> {
    let mut query = format!("SELECT {COLUMNS} FROM image_variants WHERE image_id = $1");
    if dimensions.is_some() {
        query.push_str(" AND width = $2 AND height = $3");
    }
    if format.is_some() {
        let n = if dimensions.is_some() { 4 } else { 2 };
        query.push_str(&format!(" AND format = ${n}"));
    }

    let mut q = sqlx::query_as::<_, VariantRecord>(&query).bind(image_id);
    if let Some((w, h)) = dimensions {
        q = q.bind(w).bind(h);
    }
    if let Some(f) = format {
        q = q.bind(f);
    }
    Ok(q.fetch_all(pool).await?)
}

/// Delete records by id; returns how many went away.
pub async fn delete_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<u64, ServiceError> {
    let result = sqlx::query("DELETE FROM image_variants WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Delete the record for a quadruple, if any. Used by the force-resize
/// displacement path.
pub async fn delete_by_dimensions(
    pool: &PgPool,
    image_id: &str,
    width: i32,
    height: i32,
    format: VariantFormat,
) -> Result<u64, ServiceError> {
    let result = sqlx::query(
        "DELETE FROM image_variants \
         WHERE image_id = $1 AND width = $2 AND height = $3 AND format = $4",
    )
    .bind(image_id)
    .bind(width)
    .bind(height)
    .bind(format)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Number of records in a given status. Health telemetry.
pub async fn count_by_status(
    pool: &PgPool,
    status: VariantStatus,
) -> Result<i64, ServiceError> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM image_variants WHERE status = $1")
            .bind(status)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Records sitting in `processing` longer than `older_than_secs`. These
/// indicate a stalled or crashed render and are surfaced by the monitor.
pub async fn find_stale_processing(
    pool: &PgPool,
    older_than_secs: i64,
) -> Result<Vec<VariantRecord>, ServiceError> {
    let query = format!(
        "SELECT {COLUMNS} FROM image_variants \
         WHERE status = 'processing' AND created_at < NOW() - make_interval(secs => $1)"
    );
    let records = sqlx::query_as::<_, VariantRecord>(&query)
        .bind(older_than_secs as f64)
        .fetch_all(pool)
        .await?;
    Ok(records)
}
