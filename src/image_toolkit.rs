//! Decode any common raster image and re-encode it to the canonical lossy
//! format used for promoted assets (WebP).

use std::path::Path;

use crate::error::AppError;

const DEFAULT_QUALITY: f32 = 80.0;
// libwebp's compression-effort knob (0=fastest, 6=slowest/smallest); the
// spec's canonical re-encode uses the slowest, smallest-output setting.
const DEFAULT_METHOD: i32 = 6;

/// Decode `bytes`, convert to RGB/RGBA as the source demands, and re-encode
/// to WebP at the canonical quality/method. Fails with `AppError::NotImage`
/// on decode error.
pub fn to_webp(bytes: &[u8]) -> Result<Vec<u8>, AppError> {
    let img = image::load_from_memory(bytes).map_err(|_| AppError::NotImage)?;

    let has_alpha = img.color().has_alpha();
    let encoder = if has_alpha {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(&rgba, rgba.width(), rgba.height())
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(&rgb, rgb.width(), rgb.height())
    };

    // `Encoder::encode` is the crate's one-shot API and has no way to set
    // `method`; go through `WebPConfig` instead so both quality and method
    // are honored.
    let mut config = webp::WebPConfig::new()
        .map_err(|_| AppError::ImagePrepareFailed("webp config init failed".into()))?;
    config.quality = DEFAULT_QUALITY;
    config.method = DEFAULT_METHOD;

    let encoded = encoder
        .encode_advanced(&config)
        .map_err(|e| AppError::ImagePrepareFailed(format!("webp encode failed: {e:?}")))?;
    Ok(encoded.to_vec())
}

/// Read `src`, convert, and write the result to `dst`.
pub async fn file_to_webp(src: &Path, dst: &Path) -> Result<u64, AppError> {
    let bytes = tokio::fs::read(src)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("read failed: {e}")))?;

    let src_owned = src.to_path_buf();
    let webp_bytes = tokio::task::spawn_blocking(move || to_webp_with_context(&src_owned, &bytes))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("image task failed: {e}")))??;

    tokio::fs::write(dst, &webp_bytes)
        .await
        .map_err(|e| AppError::ImagePrepareFailed(format!("write failed: {e}")))?;

    Ok(webp_bytes.len() as u64)
}

fn to_webp_with_context(_src: &Path, bytes: &[u8]) -> Result<Vec<u8>, AppError> {
    to_webp(bytes)
}

/// Pixel dimensions of an encoded image, used by tests to assert the
/// re-encode preserved the source's dimensions.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), AppError> {
    let img = image::load_from_memory(bytes).map_err(|_| AppError::NotImage)?;
    Ok((img.width(), img.height()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};

    fn sample_png_rgb() -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(4, 4, |x, y| {
            Rgb([(x * 10) as u8, (y * 10) as u8, 128])
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn sample_png_rgba() -> Vec<u8> {
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(4, 4, |x, y| {
            Rgba([(x * 10) as u8, (y * 10) as u8, 128, 200])
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn converts_opaque_png_to_webp_preserving_dimensions() {
        let png = sample_png_rgb();
        let webp = to_webp(&png).unwrap();
        assert!(!webp.is_empty());
        assert_eq!(dimensions(&png).unwrap(), dimensions(&webp).unwrap());
    }

    #[test]
    fn converts_transparent_png_to_webp_preserving_dimensions() {
        let png = sample_png_rgba();
        let webp = to_webp(&png).unwrap();
        assert!(!webp.is_empty());
        assert_eq!(dimensions(&png).unwrap(), dimensions(&webp).unwrap());
    }

    #[test]
    fn garbage_bytes_fail_as_not_image() {
        let result = to_webp(b"not an image");
        assert!(matches!(result, Err(AppError::NotImage)));
    }
}
