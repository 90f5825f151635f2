//! Validation of delivered images and frame ordering.
//!
//! Used by the integration tests against virtual cameras and by the capture
//! binary's self-check.

use thiserror::Error;

use crate::traits::{Image, PixelFormat, StreamMode};

/// A delivered image or frame sequence did not look as expected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Result type for validators.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235),
    (235, 235, 11),
    (12, 236, 237),
    (13, 237, 13),
    (237, 13, 237),
    (238, 14, 13),
    (15, 15, 239),
    (16, 16, 16),
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Validates that a YUYV image contains the SMPTE color bar pattern.
///
/// Samples the center of each of the 8 vertical bars on the middle row.
pub fn validate_color_bars(image: &Image, mode: &StreamMode) -> Result<()> {
    if mode.format != PixelFormat::Yuyv {
        return Err(ValidationError(format!(
            "color bars need a yuyv stream, {} is {}",
            mode.stream, mode.format
        )));
    }

    let bar_width = mode.width / 8;
    let center_y = mode.height / 2;

    for (bar_idx, expected_rgb) in (0u32..).zip(SMPTE_COLOR_BARS) {
        let sample_x = bar_idx * bar_width + bar_width / 2;

        let actual_rgb = image
            .pixel_at(sample_x, center_y, mode.width)
            .ok_or_else(|| {
                ValidationError(format!("Failed to get pixel at ({sample_x}, {center_y})"))
            })?;

        if !colors_match(actual_rgb, expected_rgb, COLOR_TOLERANCE) {
            return Err(ValidationError(format!(
                "Color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that frame numbers observed by a consumer strictly increase.
///
/// Gaps are allowed: a consumer slower than the producer only sees the most
/// recent frame.
pub fn validate_frame_order(numbers: &[u32]) -> Result<()> {
    if numbers.is_empty() {
        return Err(ValidationError(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in numbers.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr <= prev {
                return Err(ValidationError(format!(
                    "Frame order violated at index {}: {curr} after {prev}",
                    i + 1
                )));
            }
        }
    }

    Ok(())
}

/// Whether two RGB colors match within `tolerance` per channel.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
