//! Database row types for SQLx.
//!
//! Two tables back the service: `image_variants` holds the lifecycle state
//! of every rendition, and `background_jobs` is the durable work queue that
//! drives renditions from `queued` to `ready`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a variant record.
///
/// Transitions are monotonic within a cycle:
/// `queued -> processing -> (ready | failed)`. A `failed` record may be
/// reset to `queued` by the bounded requeue policy; `ready` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "variant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
    /// Admitted; a job is waiting in the queue.
    Queued,
    /// A worker holds the job and is rendering.
    Processing,
    /// The rendition exists in the object store.
    Ready,
    /// The last retry cycle ended in a terminal error.
    Failed,
}

impl fmt::Display for VariantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VariantStatus::Queued => "queued",
            VariantStatus::Processing => "processing",
            VariantStatus::Ready => "ready",
            VariantStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Target encoding of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "variant_format", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VariantFormat {
    /// Portable Network Graphics.
    Png,
    /// JPEG (accepted as `jpeg` or the `jpg` alias).
    Jpeg,
    /// WebP.
    Webp,
}

impl VariantFormat {
    /// Canonical lowercase name, as used in keys and the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantFormat::Png => "png",
            VariantFormat::Jpeg => "jpeg",
            VariantFormat::Webp => "webp",
        }
    }

    /// MIME type of the encoded rendition.
    pub fn content_type(&self) -> &'static str {
        match self {
            VariantFormat::Png => "image/png",
            VariantFormat::Jpeg => "image/jpeg",
            VariantFormat::Webp => "image/webp",
        }
    }

    /// Encoder selector for the `image` crate.
    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            VariantFormat::Png => image::ImageFormat::Png,
            VariantFormat::Jpeg => image::ImageFormat::Jpeg,
            VariantFormat::Webp => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for VariantFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(VariantFormat::Png),
            "jpeg" | "jpg" => Ok(VariantFormat::Jpeg),
            "webp" => Ok(VariantFormat::Webp),
            other => Err(format!("unsupported format `{other}`")),
        }
    }
}

/// A variant record: one row per `(image_id, width, height, format)`.
///
/// The unique index on that quadruple is the arbiter of deduplication
/// between concurrent admissions; everything else follows from it.
#[derive(Debug, Clone, FromRow)]
pub struct VariantRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// Logical asset identifier, extension included.
    pub image_id: String,
    /// Target width in pixels.
    pub width: i32,
    /// Target height in pixels.
    pub height: i32,
    /// Target encoding.
    pub format: VariantFormat,
    /// Object-store key of the source asset.
    pub original_key: String,
    /// Deterministic object-store key of the rendition.
    pub variant_key: String,
    /// Logical bucket the rendition belongs to.
    pub bucket: String,
    /// Lifecycle state.
    pub status: VariantStatus,
    /// Rendition size in bytes; 0 until ready.
    pub file_size: i64,
    /// Last terminal error message, if any.
    pub failed_reason: Option<String>,
    /// Timestamp of the last terminal failure, if any.
    pub failed_at: Option<DateTime<Utc>>,
    /// How many full retry cycles this record has triggered.
    pub requeue_count: i32,
    /// When the rendition became ready, if it did.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on insert, immutable.
    pub created_at: DateTime<Utc>,
}

/// A row in the `background_jobs` queue.
#[derive(Debug, Clone, FromRow)]
pub struct BackgroundJob {
    /// Queue-internal identifier.
    pub id: i64,
    /// Idempotency token, unique among live jobs when present.
    pub job_id: Option<String>,
    /// Type identifier used for dispatch.
    pub job_type: String,
    /// JSON payload.
    pub data: Value,
    /// Higher runs earlier.
    pub priority: i16,
    /// Failed attempts so far in this cycle.
    pub attempts: i32,
    /// Attempts allowed before the final-failure handler runs.
    pub max_attempts: i32,
    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: i64,
    /// Timestamp of the most recent failed attempt.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Worker currently holding the visibility lease.
    pub locked_by: Option<String>,
    /// When the lease was taken; expired leases are reclaimable.
    pub locked_at: Option<DateTime<Utc>>,
    /// Times the stall monitor had to break this job's lease.
    pub stalled_count: i32,
    /// Last reported progress percentage.
    pub progress: i16,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_accepts_the_jpg_alias() {
        assert_eq!("jpg".parse::<VariantFormat>().unwrap(), VariantFormat::Jpeg);
        assert_eq!("JPEG".parse::<VariantFormat>().unwrap(), VariantFormat::Jpeg);
        assert_eq!("webp".parse::<VariantFormat>().unwrap(), VariantFormat::Webp);
        assert!("gif".parse::<VariantFormat>().is_err());
    }

    #[test]
    fn format_names_round_trip() {
        for format in [VariantFormat::Png, VariantFormat::Jpeg, VariantFormat::Webp] {
            assert_eq!(format.as_str().parse::<VariantFormat>().unwrap(), format);
        }
    }

    #[test]
    fn enums_serialize_as_lowercase_names() {
        insta::assert_compact_json_snapshot!(
            (VariantStatus::Processing, VariantFormat::Jpeg),
            @r#"["processing", "jpeg"]"#
        );
    }
}
