//! SQL backing the background job queue.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` to serialize concurrent workers,
//! then writes a lease (`locked_by`, `locked_at`) that doubles as the
//! visibility lock: a worker that dies simply leaves an expired lease for
//! the stall monitor to break. Completed jobs are deleted; failed attempts
//! release the lease and push the next eligibility out exponentially.

use sqlx::PgPool;

use crate::errors::EnqueueError;
use crate::schema::BackgroundJob;

const JOB_COLUMNS: &str = "id, job_id, job_type, data, priority, attempts, max_attempts, \
     backoff_base_ms, last_attempt, last_error, locked_by, locked_at, stalled_count, \
     progress, created_at";

/// Insert a job. When an idempotency token is supplied and a live job
/// already carries it, the insert is swallowed and `None` is returned.
pub(crate) async fn enqueue_job(
    pool: &PgPool,
    job_type: &str,
    data: serde_json::Value,
    job_id: Option<&str>,
    priority: i16,
    max_attempts: i32,
    backoff_base_ms: i64,
) -> Result<Option<i64>, EnqueueError> {
    let id = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_id, job_type, data, priority, max_attempts, backoff_base_ms)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (job_id) DO NOTHING
        RETURNING id
        ",
    )
    .bind(job_id)
    .bind(job_type)
    .bind(data)
    .bind(priority)
    .bind(max_attempts)
    .bind(backoff_base_ms)
    .fetch_optional(pool)
    .await?;

    Ok(id)
}

/// Claim the next eligible job: unlocked (or lease expired), attempts not
/// exhausted, and past its backoff window. The select and the lease write
/// are one statement, so two workers can never claim the same row.
pub(crate) async fn claim_next_job(
    pool: &PgPool,
    job_types: &[String],
    worker: &str,
    lock_duration_secs: f64,
) -> Result<Option<BackgroundJob>, sqlx::Error> {
    let query = format!(
        r"
        WITH next_job AS (
            SELECT id AS job_pk FROM background_jobs
            WHERE job_type = ANY($1)
              AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $3))
              AND attempts < max_attempts
              AND (attempts = 0 OR last_attempt <
                   NOW() - make_interval(secs => backoff_base_ms * POWER(2, attempts - 1) / 1000.0))
            ORDER BY priority DESC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE background_jobs job
        SET locked_by = $2, locked_at = NOW(), progress = 0
        FROM next_job
        WHERE job.id = next_job.job_pk
        RETURNING {JOB_COLUMNS}
        "
    );
    sqlx::query_as::<_, BackgroundJob>(&query)
        .bind(job_types)
        .bind(worker)
        .bind(lock_duration_secs)
        .fetch_optional(pool)
        .await
}

/// Remove a job that ran to completion (or was routed to its final-failure
/// handler). Remove-on-complete keeps the queue table small.
pub(crate) async fn delete_job(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failed attempt and release the lease. Returns the attempt
/// count after the increment.
pub(crate) async fn record_failure(
    pool: &PgPool,
    id: i64,
    error: &str,
) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        r"
        UPDATE background_jobs
        SET attempts = attempts + 1, last_attempt = NOW(), last_error = $2,
            locked_by = NULL, locked_at = NULL
        WHERE id = $1
        RETURNING attempts
        ",
    )
    .bind(id)
    .bind(error)
    .fetch_one(pool)
    .await
}

/// Break every expired lease, counting the stall against the job. The
/// caller decides which of the returned jobs have stalled too often.
pub(crate) async fn release_expired_leases(
    pool: &PgPool,
    lock_duration_secs: f64,
) -> Result<Vec<BackgroundJob>, sqlx::Error> {
    let query = format!(
        r"
        UPDATE background_jobs
        SET locked_by = NULL, locked_at = NULL, stalled_count = stalled_count + 1
        WHERE locked_at IS NOT NULL AND locked_at < NOW() - make_interval(secs => $1)
        RETURNING {JOB_COLUMNS}
        "
    );
    sqlx::query_as::<_, BackgroundJob>(&query)
        .bind(lock_duration_secs)
        .fetch_all(pool)
        .await
}

/// Best-effort progress update; the job keeps running if this fails.
pub(crate) async fn update_progress(pool: &PgPool, id: i64, progress: i16) {
    let result = sqlx::query("UPDATE background_jobs SET progress = $2 WHERE id = $1")
        .bind(id)
        .bind(progress)
        .execute(pool)
        .await;
    if let Err(error) = result {
        tracing::debug!(job.id = id, %error, "failed to persist job progress");
    }
}

/// Live queue depth: total rows and how many hold a lease.
pub async fn queue_depth(pool: &PgPool) -> Result<(i64, i64), sqlx::Error> {
    sqlx::query_as::<_, (i64, i64)>("SELECT COUNT(*), COUNT(locked_at) FROM background_jobs")
        .fetch_one(pool)
        .await
}

/// The number of jobs that have failed at least once and are waiting on a
/// retry.
pub async fn retried_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs WHERE attempts > 0")
        .fetch_one(pool)
        .await
}
