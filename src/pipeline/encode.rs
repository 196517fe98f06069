//! Image encoding: raw bytes → base64 payload for the model request.
//!
//! A pure, deterministic transform. The only failure path is malformed
//! input: empty bodies and non-image bytes (HTML error pages served with a
//! 200 are a repository classic) are rejected here, before a doomed model
//! call is made. The MIME type is re-derived by sniffing the magic bytes
//! rather than trusting the server's `Content-Type` header.

use crate::error::ItemError;
use crate::pipeline::fetch::RawImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

/// Base64 image payload plus its sniffed MIME type.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Base64 of the original bytes, no data-URI prefix.
    pub data: String,
    pub mime_type: String,
}

/// Encode fetched bytes for embedding in a JSON request body.
pub fn encode_image(raw: &RawImage) -> Result<EncodedImage, ItemError> {
    if raw.bytes.is_empty() {
        return Err(ItemError::Encoding {
            detail: "empty response body".into(),
        });
    }

    let format = image::guess_format(&raw.bytes).map_err(|_| ItemError::Encoding {
        detail: format!(
            "response is not a recognisable image (served as '{}', {} bytes)",
            raw.content_type,
            raw.bytes.len()
        ),
    })?;

    let data = STANDARD.encode(&raw.bytes);
    debug!(
        mime = format.to_mime_type(),
        b64_len = data.len(),
        "encoded image"
    );

    Ok(EncodedImage {
        data,
        mime_type: format.to_mime_type().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("png encode");
        buf
    }

    #[test]
    fn encodes_png_and_sniffs_mime() {
        let raw = RawImage {
            bytes: png_bytes(),
            content_type: "application/octet-stream".into(),
        };
        let encoded = encode_image(&raw).expect("encode should succeed");
        assert_eq!(encoded.mime_type, "image/png");
        let decoded = STANDARD.decode(&encoded.data).expect("valid base64");
        assert_eq!(decoded, raw.bytes);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let raw = RawImage {
            bytes: png_bytes(),
            content_type: "image/png".into(),
        };
        assert_eq!(encode_image(&raw).unwrap().data, encode_image(&raw).unwrap().data);
    }

    #[test]
    fn empty_body_rejected() {
        let raw = RawImage {
            bytes: vec![],
            content_type: "image/jpeg".into(),
        };
        let err = encode_image(&raw).unwrap_err();
        assert!(matches!(err, ItemError::Encoding { .. }));
    }

    #[test]
    fn html_error_page_rejected() {
        let raw = RawImage {
            bytes: b"<html><body>503 Service Unavailable</body></html>".to_vec(),
            content_type: "text/html".into(),
        };
        let err = encode_image(&raw).unwrap_err();
        match err {
            ItemError::Encoding { detail } => assert!(detail.contains("text/html")),
            other => panic!("expected Encoding error, got {other:?}"),
        }
    }
}
