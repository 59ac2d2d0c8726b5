//! Frame validation utilities for test pattern verification.
//!
//! Used by integration tests against the fake backend and `vivid` virtual
//! cameras to check that frames survive acquisition, normalization and
//! calibration intact.

use thiserror::Error;

use crate::acquirer::Frame;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the test pattern generators.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Minimum left-to-right luminance rise for a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

/// Why a frame failed validation.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("pixel ({x}, {y}) is outside the frame")]
    PixelOutOfBounds { x: u32, y: u32 },

    #[error("color bar {bar} mismatch at ({x}, {y}): expected RGB{expected:?}, got RGB{actual:?}")]
    ColorMismatch {
        bar: usize,
        x: u32,
        y: u32,
        expected: (u8, u8, u8),
        actual: (u8, u8, u8),
    },

    #[error("gradient not monotonically increasing at x={x}: luminance {luminance} < previous {previous}")]
    NotMonotonic { x: u32, luminance: f32, previous: f32 },

    #[error("insufficient luminance change for gradient: {0} (expected at least 50)")]
    FlatGradient(f32),

    #[error("cannot validate empty frame sequence")]
    EmptySequence,

    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap { index: usize, expected: u64, actual: u64 },
}

fn pixel(frame: &Frame, x: u32, y: u32) -> Result<(u8, u8, u8), ValidationError> {
    frame.pixel_at(x, y).ok_or(ValidationError::PixelOutOfBounds { x, y })
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Checks 8 vertical stripes at their center positions, verifying that each
/// stripe contains the expected color within a tolerance for YUV-to-RGB
/// conversion inaccuracies.
pub fn validate_color_bars(frame: &Frame) -> Result<(), ValidationError> {
    let bar_width = frame.width / 8;
    let center_y = frame.height / 2;

    for (bar, expected) in SMPTE_COLOR_BARS.iter().enumerate() {
        // Sample the center of each bar
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);
        let actual = pixel(frame, x, center_y)?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorMismatch {
                bar,
                x,
                y: center_y,
                expected: *expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row every 10 pixels and requires non-decreasing
/// luminance with a significant overall rise (not a solid color).
pub fn validate_gradient(frame: &Frame) -> Result<(), ValidationError> {
    let center_y = frame.height / 2;
    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..frame.width).step_by(10) {
        let (r, g, b) = pixel(frame, x, center_y)?;

        // Calculate luminance (Y' in Rec. 601)
        let luminance = 0.114f32.mul_add(f32::from(b), 0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)));

        first.get_or_insert(luminance);
        if let Some(prev) = previous {
            // Allow small decreases due to rounding
            if luminance < prev - 1.0 {
                return Err(ValidationError::NotMonotonic {
                    x,
                    luminance,
                    previous: prev,
                });
            }
        }
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let rise = last - first;
        if rise < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient(rise));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence + 1;
            if curr.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    index: index + 1,
                    expected,
                    actual: curr.sequence,
                });
            }
        }
    }

    Ok(())
}

/// Helper function to check if two RGB colors match within a tolerance.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
