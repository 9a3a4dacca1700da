//! Size-bounded image derivatives.
//!
//! Inputs already under the byte target pass through untouched. Larger
//! inputs are re-encoded as JPEG at decreasing quality; once the quality
//! floor is reached the image is shrunk geometrically by
//! `sqrt(target / current)` per pass. Both loops are bounded and neither
//! ever upscales.

use std::{io::Cursor, sync::Arc};

use image::{
    DynamicImage, ExtendedColorType, RgbImage, codecs::jpeg::JpegEncoder,
    imageops::FilterType,
};

use crate::{config::FetchConfig, error::FetchError, prepared::PreparedImage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivativeSettings {
    pub target_bytes: u64,
    pub quality_step: f32,
    pub quality_floor: f32,
    pub max_downscale_passes: u32,
}

impl From<&FetchConfig> for DerivativeSettings {
    fn from(config: &FetchConfig) -> Self {
        Self {
            target_bytes: config.image_target_bytes.as_bytes(),
            quality_step: config.quality_step,
            quality_floor: config.quality_floor,
            max_downscale_passes: config.max_downscale_passes,
        }
    }
}

impl DerivativeSettings {
    /// JPEG qualities to try, highest first, ending at the floor.
    fn quality_ladder(&self) -> Vec<u8> {
        let step = percent(self.quality_step).max(1);
        let floor = percent(self.quality_floor).max(1);
        let mut ladder = Vec::new();
        let mut quality = 100u8.saturating_sub(step);
        while quality >= floor {
            ladder.push(quality);
            quality = match quality.checked_sub(step) {
                Some(next) => next,
                None => break,
            };
        }
        if ladder.last() != Some(&floor) {
            ladder.push(floor);
        }
        ladder
    }
}

fn percent(fraction: f32) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Decode a stored derivative without any size handling.
pub fn decode_derivative(bytes: &[u8]) -> Result<PreparedImage, FetchError> {
    let decoded = decode(bytes)?;
    Ok(finish(bytes.to_vec(), &decoded))
}

/// Build a derivative no larger than `settings.target_bytes`.
pub fn prepare_image(
    bytes: &[u8],
    settings: &DerivativeSettings,
) -> Result<PreparedImage, FetchError> {
    let decoded = decode(bytes)?;
    let target = settings.target_bytes;
    if bytes.len() as u64 <= target {
        return Ok(finish(bytes.to_vec(), &decoded));
    }

    let mut current = decoded.to_rgb8();
    let mut last_len = bytes.len() as u64;
    for quality in settings.quality_ladder() {
        let encoded = encode_jpeg(&current, quality)?;
        if encoded.len() as u64 <= target {
            tracing::trace!(
                quality,
                len = encoded.len(),
                "derivative fits after re-encode"
            );
            return Ok(finish(encoded, &DynamicImage::ImageRgb8(current)));
        }
        last_len = encoded.len() as u64;
    }

    let floor = percent(settings.quality_floor).max(1);
    for pass in 0..settings.max_downscale_passes {
        let ratio = (target as f64 / last_len as f64).sqrt();
        let Some((width, height)) =
            shrink(current.width(), current.height(), ratio)
        else {
            break;
        };
        current = image::imageops::resize(
            &current,
            width,
            height,
            FilterType::Triangle,
        );
        let encoded = encode_jpeg(&current, floor)?;
        if encoded.len() as u64 <= target {
            tracing::trace!(
                pass,
                width,
                height,
                len = encoded.len(),
                "derivative fits after downscale"
            );
            return Ok(finish(encoded, &DynamicImage::ImageRgb8(current)));
        }
        last_len = encoded.len() as u64;
    }

    Err(FetchError::Oversized { target })
}

/// Scaled dimensions, strictly smaller than the input; `None` once the
/// image cannot shrink any further.
fn shrink(width: u32, height: u32, ratio: f64) -> Option<(u32, u32)> {
    if width <= 1 && height <= 1 {
        return None;
    }
    let ratio = ratio.clamp(0.0, 1.0);
    let scale = |side: u32| -> u32 {
        let scaled = (side as f64 * ratio).floor() as u32;
        scaled.clamp(1, side.saturating_sub(1).max(1))
    };
    Some((scale(width), scale(height)))
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, FetchError> {
    if bytes.is_empty() {
        return Err(FetchError::EmptyBody);
    }
    image::load_from_memory(bytes)
        .map_err(|e| FetchError::Decode(e.to_string()))
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FetchError> {
    let mut out = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| FetchError::Decode(format!("jpeg encode failed: {e}")))?;
    Ok(out.into_inner())
}

fn finish(encoded: Vec<u8>, image: &DynamicImage) -> PreparedImage {
    let rgba = image.to_rgba8();
    PreparedImage {
        encoded: Arc::from(encoded),
        width: rgba.width(),
        height: rgba.height(),
        rgba: Arc::from(rgba.into_raw()),
    }
}
