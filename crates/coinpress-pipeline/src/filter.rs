//! Default pixel filter: grayscale conversion plus tonal adjustments.
//!
//! The generation core treats filtering as a black box that returns a
//! same-sized luminance buffer. This module is the stock implementation
//! used when a job carries [`FilterSettings`].

use std::fmt;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Channel mix used to reduce colour pixels to a single luminance value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrayscaleMethod {
    /// ITU-R BT.601 weights: `0.299*R + 0.587*G + 0.114*B`.
    #[default]
    Luminance,
    /// Unweighted mean of the three channels.
    Average,
    /// Red channel only.
    Red,
    /// Green channel only.
    Green,
    /// Blue channel only.
    Blue,
}

impl GrayscaleMethod {
    fn convert(self, [r, g, b, _]: [u8; 4]) -> u8 {
        let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
        let value = match self {
            Self::Luminance => 0.299f64.mul_add(r, 0.587f64.mul_add(g, 0.114 * b)),
            Self::Average => (r + g + b) / 3.0,
            Self::Red => r,
            Self::Green => g,
            Self::Blue => b,
        };
        to_u8(value)
    }
}

impl fmt::Display for GrayscaleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Luminance => f.write_str("luminance"),
            Self::Average => f.write_str("average"),
            Self::Red => f.write_str("red"),
            Self::Green => f.write_str("green"),
            Self::Blue => f.write_str("blue"),
        }
    }
}

/// User-adjustable filter applied before the heightmap is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// How colour pixels are reduced to gray.
    pub grayscale: GrayscaleMethod,
    /// Brightness shift in `-100..=100`; 0 leaves pixels unchanged.
    pub brightness: i32,
    /// Contrast in percent, `0..=300`; 100 leaves pixels unchanged.
    pub contrast: u32,
    /// Gamma in `0.1..=5.0`; 1.0 leaves pixels unchanged.
    pub gamma: f64,
    /// Flip light and dark so dark areas stand proud.
    pub invert: bool,
}

impl FilterSettings {
    /// Accepted brightness range.
    pub const BRIGHTNESS_RANGE: std::ops::RangeInclusive<i32> = -100..=100;
    /// Accepted contrast range (percent).
    pub const CONTRAST_RANGE: std::ops::RangeInclusive<u32> = 0..=300;
    /// Accepted gamma range.
    pub const GAMMA_RANGE: std::ops::RangeInclusive<f64> = 0.1..=5.0;

    /// Reject settings outside their documented ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidParameters`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !Self::BRIGHTNESS_RANGE.contains(&self.brightness) {
            return Err(PipelineError::InvalidParameters(format!(
                "brightness must be within -100..=100, got {}",
                self.brightness
            )));
        }
        if !Self::CONTRAST_RANGE.contains(&self.contrast) {
            return Err(PipelineError::InvalidParameters(format!(
                "contrast must be within 0..=300, got {}",
                self.contrast
            )));
        }
        if !Self::GAMMA_RANGE.contains(&self.gamma) {
            return Err(PipelineError::InvalidParameters(format!(
                "gamma must be within 0.1..=5.0, got {}",
                self.gamma
            )));
        }
        Ok(())
    }

    /// Returns `true` if applying these settings to a gray image is a no-op.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.brightness == 0
            && self.contrast == 100
            && (self.gamma - 1.0).abs() < f64::EPSILON
            && !self.invert
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            grayscale: GrayscaleMethod::default(),
            brightness: 0,
            contrast: 100,
            gamma: 1.0,
            invert: false,
        }
    }
}

/// Reduce an RGBA image to gray with the given channel mix.
#[must_use = "returns the grayscale image"]
pub fn to_gray(rgba: &RgbaImage, method: GrayscaleMethod) -> GrayImage {
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        image::Luma([method.convert(rgba.get_pixel(x, y).0)])
    })
}

/// Apply brightness, contrast, gamma, and inversion, in that order.
///
/// Contrast scales each pixel's distance from the image's mean luminance,
/// so a flat image stays flat.
#[must_use = "returns the adjusted image"]
pub fn adjust(gray: &GrayImage, settings: &FilterSettings) -> GrayImage {
    if settings.is_identity() {
        return gray.clone();
    }

    let mut out = gray.clone();

    if settings.brightness != 0 {
        let factor = 1.0 + f64::from(settings.brightness) / 100.0;
        for p in out.pixels_mut() {
            p.0[0] = to_u8(f64::from(p.0[0]) * factor);
        }
    }

    if settings.contrast != 100 {
        let factor = f64::from(settings.contrast) / 100.0;
        let mean = mean_luma(&out);
        for p in out.pixels_mut() {
            p.0[0] = to_u8((f64::from(p.0[0]) - mean).mul_add(factor, mean));
        }
    }

    if (settings.gamma - 1.0).abs() >= f64::EPSILON {
        let lut = gamma_lut(settings.gamma);
        for p in out.pixels_mut() {
            p.0[0] = lut[usize::from(p.0[0])];
        }
    }

    if settings.invert {
        image::imageops::invert(&mut out);
    }

    out
}

fn gamma_lut(gamma: f64) -> [u8; 256] {
    let inverse = 1.0 / gamma;
    let mut lut = [0u8; 256];
    for (v, slot) in (0u8..=255).zip(lut.iter_mut()) {
        *slot = to_u8(255.0 * (f64::from(v) / 255.0).powf(inverse));
    }
    lut
}

fn mean_luma(gray: &GrayImage) -> f64 {
    let count = u64::from(gray.width()) * u64::from(gray.height());
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.pixels().map(|p| u64::from(p.0[0])).sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = sum as f64 / count as f64;
    mean
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
