//! HTTP handlers for the rendition service.
//!
//! Handlers validate once into plain structs and then talk to the
//! resolver; nothing downstream re-parses request input.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::errors::ServiceError;
use crate::jobs::CACHE_CONTROL_IMMUTABLE;
use crate::routes::AppState;
use crate::schema::VariantFormat;

/// Cache policy while a rendition is still being produced.
const CACHE_CONTROL_VOLATILE: &str = "no-cache, no-store, must-revalidate";

/// Smallest and largest accepted edge length, in pixels.
const DIMENSION_RANGE: std::ops::RangeInclusive<i32> = 1..=5000;

/// Raw query parameters of `GET /{imageId}`.
#[derive(Debug, Default, Deserialize)]
pub struct ResizeQuery {
    /// Target width.
    pub w: Option<String>,
    /// Target height.
    pub h: Option<String>,
    /// Output format (`png`, `jpeg`, `jpg`, `webp`).
    pub format: Option<String>,
    /// `"true"` displaces an existing rendition before re-admitting.
    pub force_resize: Option<String>,
}

/// Raw query parameters of `DELETE /{imageId}`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Selector width.
    pub w: Option<String>,
    /// Selector height.
    pub h: Option<String>,
    /// Selector format.
    pub format: Option<String>,
}

/// Validated resize parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeParams {
    /// Both present or neither.
    pub dimensions: Option<(i32, i32)>,
    /// Requested output format, if any.
    pub format: Option<VariantFormat>,
    /// Whether to displace an existing rendition.
    pub force_resize: bool,
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// `GET /{imageId}`: redirect to the rendition or the original.
pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> Result<Response, ServiceError> {
    let params = validate_resize_query(&query)?;

    let resolution = state
        .resolver
        .resolve_variant(
            &image_id,
            params.dimensions,
            params.format,
            params.force_resize,
        )
        .await?;

    let location = state.resolver.public_url(&resolution.key);
    let (image_status, cache_control) = if resolution.ready {
        ("ready", CACHE_CONTROL_IMMUTABLE)
    } else {
        ("processing", CACHE_CONTROL_VOLATILE)
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location)
            .map_err(|_| ServiceError::Validation("unencodable redirect target".into()))?,
    );
    headers.insert("x-image-status", HeaderValue::from_static(image_status));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    Ok(response)
}

/// `DELETE /{imageId}`: remove variants matching the selector; with no
/// selector, every variant of the image.
pub async fn delete_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Response, ServiceError> {
    let dimensions = validate_dimension_pair(&query.w, &query.h)?;
    let format = parse_format(&query.format)?;

    state
        .resolver
        .delete_image(&image_id, dimensions, format)
        .await?;

    Ok(Json(json!({ "message": "Image deleted successfully" })).into_response())
}

pub(crate) fn validate_resize_query(query: &ResizeQuery) -> Result<ResizeParams, ServiceError> {
    let dimensions = validate_dimension_pair(&query.w, &query.h)?;
    let format = parse_format(&query.format)?;

    let force_resize = match query.force_resize.as_deref() {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(ServiceError::Validation(format!(
                "force_resize must be `true` or `false`, got `{other}`"
            )));
        }
    };

    Ok(ResizeParams {
        dimensions,
        format,
        force_resize,
    })
}

fn validate_dimension_pair(
    w: &Option<String>,
    h: &Option<String>,
) -> Result<Option<(i32, i32)>, ServiceError> {
    match (w, h) {
        (None, None) => Ok(None),
        (Some(w), Some(h)) => Ok(Some((parse_dimension("w", w)?, parse_dimension("h", h)?))),
        _ => Err(ServiceError::Validation(
            "w and h must be provided together".into(),
        )),
    }
}

fn parse_dimension(name: &str, raw: &str) -> Result<i32, ServiceError> {
    let value: i32 = raw.parse().map_err(|_| {
        ServiceError::Validation(format!("{name} must be an integer, got `{raw}`"))
    })?;
    if !DIMENSION_RANGE.contains(&value) {
        return Err(ServiceError::Validation(format!(
            "{name} must be between {} and {}, got {value}",
            DIMENSION_RANGE.start(),
            DIMENSION_RANGE.end()
        )));
    }
    Ok(value)
}

fn parse_format(raw: &Option<String>) -> Result<Option<VariantFormat>, ServiceError> {
    raw.as_deref()
        .map(|f| f.parse::<VariantFormat>().map_err(ServiceError::Validation))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn query(
        w: Option<&str>,
        h: Option<&str>,
        format: Option<&str>,
        force: Option<&str>,
    ) -> ResizeQuery {
        ResizeQuery {
            w: w.map(String::from),
            h: h.map(String::from),
            format: format.map(String::from),
            force_resize: force.map(String::from),
        }
    }

    #[test]
    fn accepts_a_full_resize_request() {
        let params =
            validate_resize_query(&query(Some("200"), Some("100"), Some("webp"), Some("true")))
                .unwrap();
        assert_eq!(params.dimensions, Some((200, 100)));
        assert_eq!(params.format, Some(VariantFormat::Webp));
        assert!(params.force_resize);
    }

    #[test]
    fn accepts_a_dimensionless_request() {
        let params = validate_resize_query(&query(None, None, None, None)).unwrap();
        assert_eq!(params.dimensions, None);
        assert_eq!(params.format, None);
        assert!(!params.force_resize);
    }

    #[test]
    fn rejects_lone_dimensions() {
        assert_err!(validate_resize_query(&query(Some("200"), None, None, None)));
        assert_err!(validate_resize_query(&query(None, Some("100"), None, None)));
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        assert_err!(validate_resize_query(&query(Some("0"), Some("100"), None, None)));
        assert_err!(validate_resize_query(&query(Some("200"), Some("5001"), None, None)));
        assert_err!(validate_resize_query(&query(Some("-5"), Some("5"), None, None)));
        assert_err!(validate_resize_query(&query(Some("1.5"), Some("5"), None, None)));
        assert_ok!(validate_resize_query(&query(Some("1"), Some("5000"), None, None)));
    }

    #[test]
    fn rejects_unknown_formats_and_flags() {
        assert_err!(validate_resize_query(&query(
            Some("10"),
            Some("10"),
            Some("gif"),
            None
        )));
        assert_err!(validate_resize_query(&query(None, None, None, Some("yes"))));
        assert_ok!(validate_resize_query(&query(None, None, None, Some("false"))));
    }

    #[test]
    fn jpg_alias_normalizes() {
        let params =
            validate_resize_query(&query(Some("10"), Some("10"), Some("jpg"), None)).unwrap();
        assert_eq!(params.format, Some(VariantFormat::Jpeg));
    }
}
