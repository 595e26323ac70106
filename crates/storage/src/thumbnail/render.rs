//! Decode, resize and JPEG-encode.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::ImageReader;

use crate::context::RequestContext;
use crate::error::{Result, StorageError};

/// JPEG quality for every thumbnail.
pub const JPEG_QUALITY: u8 = 85;

/// Scale `(width, height)` so the longer side equals `max_dim`.
///
/// The shorter side is truncated and never drops below one pixel. Images
/// smaller than `max_dim` are scaled up.
pub fn target_dimensions(width: u32, height: u32, max_dim: u32) -> (u32, u32) {
    let width = u64::from(width.max(1));
    let height = u64::from(height.max(1));
    let max = u64::from(max_dim);

    if width >= height {
        let scaled = (height * max / width).max(1);
        (max_dim, scaled as u32)
    } else {
        let scaled = (width * max / height).max(1);
        (scaled as u32, max_dim)
    }
}

/// Render `source` into a JPEG whose longer side is `max_dim`.
///
/// `ctx` is checked between decode and resize, the two expensive steps.
pub fn render_jpeg(source: &[u8], max_dim: u32, ctx: &RequestContext) -> Result<Vec<u8>> {
    // The source is already in memory, so every failure here is bad content.
    let decoded = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| StorageError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| StorageError::Decode(e.to_string()))?;
    ctx.check()?;

    let rgb = decoded.to_rgb8();
    let (width, height) = target_dimensions(rgb.width(), rgb.height(), max_dim);
    let resized = imageops::resize(&rgb, width, height, FilterType::Triangle);

    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY).encode_image(&resized)?;
    Ok(output)
}
