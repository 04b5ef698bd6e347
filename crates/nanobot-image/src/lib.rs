// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Image preparation for multimodal LLM requests.
//!
//! Attachments are downscaled to [`MAX_DIMENSION`] and re-encoded as JPEG
//! with descending quality until the payload fits [`MAX_ENCODED_BYTES`] (or
//! quality bottoms out at [`MIN_JPEG_QUALITY`]). The result is returned as a
//! data URL ready to embed in an `image_url` content block.

use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::codecs::jpeg::JpegEncoder;

pub use error::ImageError;

mod error;

/// Maximum width/height in pixels before downscaling.
pub const MAX_DIMENSION: u32 = 1024;
/// Target upper bound for the encoded image payload.
pub const MAX_ENCODED_BYTES: usize = 200_000;
/// JPEG quality floor; below this the image ships as-is even if oversized.
pub const MIN_JPEG_QUALITY: u8 = 30;
const START_JPEG_QUALITY: u8 = 85;
const QUALITY_STEP: u8 = 15;

/// A compressed image ready for the wire.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Always `"image/jpeg"` after recompression.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    /// Return a data URL: `data:<mime>;base64,<b64>`.
    pub fn into_data_url(self) -> String {
        format!("data:{};base64,{}", self.mime_type, B64.encode(&self.bytes))
    }
}

/// Load, downscale, and recompress an image file.
pub fn compress_image(path: &Path) -> Result<EncodedImage, ImageError> {
    let raw = std::fs::read(path).map_err(|e| ImageError::Io(path.display().to_string(), e))?;
    compress_image_bytes(&raw, path)
}

/// Same as [`compress_image`] but for bytes already in memory.
/// `hint_path` is used only for format fallback and error messages.
pub fn compress_image_bytes(raw: &[u8], hint_path: &Path) -> Result<EncodedImage, ImageError> {
    let fmt = image::guess_format(raw)
        .ok()
        .or_else(|| format_from_extension(hint_path))
        .ok_or_else(|| ImageError::UnsupportedFormat(hint_path.display().to_string()))?;

    let img = image::load_from_memory_with_format(raw, fmt)
        .map_err(|e| ImageError::Decode(hint_path.display().to_string(), e.to_string()))?;

    let img = if img.width() > MAX_DIMENSION || img.height() > MAX_DIMENSION {
        img.thumbnail(MAX_DIMENSION, MAX_DIMENSION)
    } else {
        img
    };
    let rgb = img.to_rgb8();

    let mut quality = START_JPEG_QUALITY;
    loop {
        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&rgb)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        let bytes = out.into_inner();
        if bytes.len() <= MAX_ENCODED_BYTES || quality <= MIN_JPEG_QUALITY {
            return Ok(EncodedImage {
                mime_type: "image/jpeg".into(),
                bytes,
            });
        }
        quality = quality.saturating_sub(QUALITY_STEP).max(MIN_JPEG_QUALITY);
    }
}

fn format_from_extension(path: &Path) -> Option<image::ImageFormat> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(image::ImageFormat::Jpeg),
        "png" => Some(image::ImageFormat::Png),
        "gif" => Some(image::ImageFormat::Gif),
        "webp" => Some(image::ImageFormat::WebP),
        "bmp" => Some(image::ImageFormat::Bmp),
        "tif" | "tiff" => Some(image::ImageFormat::Tiff),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
