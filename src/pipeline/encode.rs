//! Image encoding: PNG on disk → base64 `ImageData` for the VLM request.
//!
//! Pages and screenshots are already PNG files, so the bytes are wrapped as
//! they are; decoding and re-encoding would only cost time. PNG is lossless,
//! which matters here: the model compares fine glyph and border detail
//! between the reference page and the rendering.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// Load an image file and wrap it for a multimodal chat message.
///
/// `detail: "high"` asks GPT-class models for full-resolution tiling;
/// without it small text and thin rules are lost.
pub async fn encode_file(path: &Path) -> std::io::Result<ImageData> {
    let bytes = tokio::fs::read(path).await?;
    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());
    Ok(ImageData::new(b64, mime_for(path)).with_detail("high"))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[tokio::test]
    async fn encode_png_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();

        let data = encode_file(&path).await.expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = encode_file(Path::new("/nonexistent/page.png")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.png")), "image/png");
        assert_eq!(mime_for(Path::new("a")), "image/png");
    }
}
