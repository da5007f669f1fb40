//! CPU-bound image rendering.
//!
//! Rendering is cover-fit: scale the source so it covers the target box,
//! then center-crop to the exact dimensions. These functions are
//! synchronous on purpose; callers run them on the blocking thread pool so
//! a large decode never steals time from network I/O.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::errors::ServiceError;
use crate::schema::VariantFormat;

/// Decode `source`, resize to exactly `width`x`height` with cover-fit and
/// center positioning, and re-encode as `format`.
pub fn render_cover(
    source: &[u8],
    width: u32,
    height: u32,
    format: VariantFormat,
) -> Result<Vec<u8>, ServiceError> {
    let decoded = image::load_from_memory(source)
        .map_err(|err| ServiceError::Render(format!("decode failed: {err}")))?;

    let resized = decoded.resize_to_fill(width, height, FilterType::Lanczos3);

    // Encoders are picky about pixel layouts: JPEG has no alpha channel and
    // the WebP encoder wants RGB(A)8.
    let normalized = match format {
        VariantFormat::Jpeg => DynamicImage::ImageRgb8(resized.to_rgb8()),
        VariantFormat::Webp => DynamicImage::ImageRgba8(resized.to_rgba8()),
        VariantFormat::Png => resized,
    };

    let mut buffer = Cursor::new(Vec::new());
    normalized
        .write_to(&mut buffer, format.image_format())
        .map_err(|err| ServiceError::Render(format!("encode failed: {err}")))?;

    Ok(buffer.into_inner())
}

/// MIME type of an encoded buffer, determined by sniffing its magic bytes.
/// Falls back to the generic binary type for unrecognized content.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        Ok(ImageFormat::Avif) => "image/avif",
        _ => "application/octet-stream",
    }
}
