//! Deterministic object-store keys and public URLs.
//!
//! The original asset is stored under its image id verbatim; a rendition is
//! stored under `<name>___<W>x<H>.<format>` where `<name>` is the image id
//! minus its final extension. Key derivation must be a pure function of its
//! inputs so that resolver and worker agree across restarts.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::schema::VariantFormat;

/// Separator between the asset name and the rendition dimensions.
const VARIANT_SEPARATOR: &str = "___";

/// Validate an image id: word characters, dots, and dashes only, and at
/// least one dot so the original carries an extension. Path separators are
/// rejected outright; nested keys are not supported.
pub fn validate_image_id(image_id: &str) -> Result<(), ServiceError> {
    if image_id.is_empty() {
        return Err(ServiceError::Validation("image id must not be empty".into()));
    }
    if !image_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ServiceError::Validation(format!(
            "image id `{image_id}` contains unsupported characters"
        )));
    }
    if !image_id.contains('.') {
        return Err(ServiceError::Validation(format!(
            "image id `{image_id}` must include a file extension"
        )));
    }
    Ok(())
}

/// The object-store key of the original asset.
pub fn original_key(image_id: &str) -> String {
    image_id.to_string()
}

/// The deterministic object-store key of a rendition.
pub fn variant_key(image_id: &str, width: i32, height: i32, format: VariantFormat) -> String {
    format!(
        "{}{VARIANT_SEPARATOR}{width}x{height}.{format}",
        strip_extension(image_id)
    )
}

/// Drop the final `.ext` component, keeping earlier dots intact.
pub fn strip_extension(image_id: &str) -> &str {
    match image_id.rsplit_once('.') {
        Some((name, _ext)) if !name.is_empty() => name,
        _ => image_id,
    }
}

/// The extension of an image id, lowercased, if it has one.
pub fn extension(image_id: &str) -> Option<String> {
    image_id
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Idempotency token for a render job. The trailing timestamp makes a
/// deliberate requeue distinct from the token of a previously completed
/// job while still deduplicating concurrent admissions of the same record.
pub fn job_token(
    image_id: &str,
    width: i32,
    height: i32,
    format: VariantFormat,
    record_id: Uuid,
) -> String {
    format!(
        "{image_id}_{width}x{height}.{format}.{record_id}.{}",
        Utc::now().timestamp_millis()
    )
}

/// Join an object key onto the configured public base URL, percent-encoding
/// each path segment.
pub fn public_url(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    let encoded = key
        .split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/");
    format!("{base}/{encoded}")
}

/// Percent-encode a single path segment, leaving RFC 3986 unreserved
/// characters as-is.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn variant_key_is_deterministic() {
        let key = variant_key("pic.png", 200, 100, VariantFormat::Webp);
        assert_eq!(key, "pic___200x100.webp");
        assert_eq!(key, variant_key("pic.png", 200, 100, VariantFormat::Webp));
    }

    #[test]
    fn variant_key_keeps_inner_dots() {
        assert_eq!(
            variant_key("archive.2024.jpg", 50, 50, VariantFormat::Png),
            "archive.2024___50x50.png"
        );
    }

    #[test]
    fn strip_extension_edge_cases() {
        assert_eq!(strip_extension("pic.png"), "pic");
        assert_eq!(strip_extension("a.b.png"), "a.b");
        assert_eq!(strip_extension("noext"), "noext");
        assert_eq!(strip_extension(".hidden"), ".hidden");
    }

    #[test]
    fn image_id_validation() {
        assert_ok!(validate_image_id("pic.png"));
        assert_ok!(validate_image_id("some_file-v2.jpeg"));
        assert_err!(validate_image_id(""));
        assert_err!(validate_image_id("noextension"));
        assert_err!(validate_image_id("nested/path.png"));
        assert_err!(validate_image_id("spaces are bad.png"));
        assert_err!(validate_image_id("../escape.png"));
    }

    #[test]
    fn public_url_encodes_segments() {
        assert_eq!(
            public_url("https://cdn.example.com/", "pic___200x100.webp"),
            "https://cdn.example.com/pic___200x100.webp"
        );
        assert_eq!(
            public_url("https://cdn.example.com", "oddâname.png"),
            "https://cdn.example.com/odd%C3%A2name.png"
        );
    }

    #[test]
    fn job_token_embeds_the_quadruple_and_record() {
        let record_id = Uuid::new_v4();
        let token = job_token("pic.png", 200, 100, VariantFormat::Webp, record_id);
        assert!(token.starts_with("pic.png_200x100.webp."));
        assert!(token.contains(&record_id.to_string()));
    }
}
