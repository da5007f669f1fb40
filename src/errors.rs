//! Error taxonomy shared by the resolver, the render worker, and the HTTP
//! edge.
//!
//! Read-path errors map onto HTTP responses; write-path errors are handed
//! back to the queue, which decides between retry, requeue, and giving up.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Unified error type for the rendition service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed request parameters. Maps to `400`.
    #[error("{0}")]
    Validation(String),

    /// Request path points at the rendition bucket itself. Maps to `403`.
    #[error("requests under the resized-image prefix are not served")]
    Forbidden,

    /// The original asset (or a selector match) does not exist. Maps to `404`.
    #[error("image not found: {0}")]
    NotFound(String),

    /// A concurrent admission won the unique-index race. Recovered locally
    /// by re-reading the record; never surfaces to clients.
    #[error("variant record already exists")]
    Conflict,

    /// The original could not be fetched from the object store.
    #[error("source object unavailable: {0}")]
    SourceUnavailable(String),

    /// A pipeline step breached its wall-clock budget.
    #[error("step `{step}` timed out after {seconds}s")]
    Timeout { step: &'static str, seconds: u64 },

    /// Decoding, resizing, or re-encoding failed.
    #[error("render failed: {0}")]
    Render(String),

    /// The rendition could not be written to the object store.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The variant record vanished mid-pipeline. Terminal: retrying a job
    /// whose record is gone cannot succeed.
    #[error("variant record missing")]
    RecordMissing,

    /// Transient metadata-store failure; retried by the caller's backoff.
    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Object-store failure outside the render pipeline (head, delete).
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Failure while handing a job to the queue.
    #[error("queue error: {0}")]
    Queue(String),
}

impl From<EnqueueError> for ServiceError {
    fn from(err: EnqueueError) -> Self {
        ServiceError::Queue(err.to_string())
    }
}

impl ServiceError {
    /// Terminal errors gain nothing from queue retries; the worker routes
    /// them straight to the final-failure handler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceError::RecordMissing)
    }

    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServiceError::NotFound(_) => "Image not found".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// Errors that can occur while enqueueing a background job.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The queue table rejected the insert.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ServiceError::RecordMissing.is_terminal());
        assert!(!ServiceError::Render("boom".into()).is_terminal());
        assert!(!ServiceError::Timeout { step: "render", seconds: 60 }.is_terminal());
    }

    #[test]
    fn read_path_status_codes() {
        assert_eq!(
            ServiceError::Validation("w out of range".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ServiceError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ServiceError::NotFound("absent.jpg".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Render("bad".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
