//! Normalised relief samples derived from a gray image.
//!
//! Luminance `0..=255` maps linearly onto height `0.0..=1.0`: white
//! stands proud, black sits on the base. Images larger than the working
//! resolution are downsampled first so mesh sampling cost stays bounded.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, PipelineError};

/// Default longest-axis limit for heightmaps, in pixels.
pub const DEFAULT_MAX_RESOLUTION: u32 = 1024;

/// A row-major grid of heights in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heightmap {
    width: u32,
    height: u32,
    samples: Vec<f32>,
}

impl Heightmap {
    /// Build from explicit samples, clamping each into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Geometry`] if either dimension is zero or
    /// the sample count does not match.
    pub fn from_samples(width: u32, height: u32, samples: Vec<f32>) -> Result<Self, PipelineError> {
        let dims = Dimensions { width, height };
        if dims.is_empty() {
            return Err(PipelineError::Geometry(format!(
                "heightmap has a zero dimension ({width}x{height})"
            )));
        }
        if u64::try_from(samples.len()).ok() != Some(dims.pixel_count()) {
            return Err(PipelineError::Geometry(format!(
                "{} samples for a {width}x{height} heightmap",
                samples.len()
            )));
        }
        let samples = samples
            .into_iter()
            .map(|s| if s.is_finite() { s.clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Ok(Self {
            width,
            height,
            samples,
        })
    }

    /// Build from a gray image, downsampling so neither axis exceeds
    /// `max_resolution`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Geometry`] if the image has a zero dimension.
    pub fn from_gray(gray: &GrayImage, max_resolution: u32) -> Result<Self, PipelineError> {
        let dims = Dimensions {
            width: gray.width(),
            height: gray.height(),
        };
        if dims.is_empty() {
            return Err(PipelineError::Geometry(format!(
                "image has a zero dimension ({}x{})",
                dims.width, dims.height
            )));
        }
        let resized = downsample(gray, max_resolution);
        let source = resized.as_ref().unwrap_or(gray);
        let samples = source
            .as_raw()
            .iter()
            .map(|&v| f32::from(v) / 255.0)
            .collect();
        Ok(Self {
            width: source.width(),
            height: source.height(),
            samples,
        })
    }

    /// Grid width in texels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in texels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Grid dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// All samples in row-major order.
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Height at an integer texel, or `None` outside the grid.
    #[must_use]
    pub fn get(&self, col: u32, row: u32) -> Option<f32> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let idx = row as usize * self.width as usize + col as usize;
        self.samples.get(idx).copied()
    }

    /// Bilinear height at fractional pixel coordinates, where `(0, 0)` is
    /// the top-left corner of the image and texel centres sit at `+0.5`.
    ///
    /// Returns `None` outside `[0, W] x [0, H]`. Within the outer half-texel
    /// border the nearest edge texel is used.
    #[must_use]
    pub fn sample_bilinear(&self, px: f64, py: f64) -> Option<f32> {
        let (w, h) = (f64::from(self.width), f64::from(self.height));
        if !(0.0..=w).contains(&px) || !(0.0..=h).contains(&py) {
            return None;
        }
        let fx = (px - 0.5).clamp(0.0, w - 1.0);
        let fy = (py - 0.5).clamp(0.0, h - 1.0);
        let (x0, y0) = (fx.floor(), fy.floor());
        let (tx, ty) = (fx - x0, fy - y0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (c0, r0) = (x0 as u32, y0 as u32);
        let c1 = (c0 + 1).min(self.width - 1);
        let r1 = (r0 + 1).min(self.height - 1);

        let v00 = f64::from(self.get(c0, r0)?);
        let v10 = f64::from(self.get(c1, r0)?);
        let v01 = f64::from(self.get(c0, r1)?);
        let v11 = f64::from(self.get(c1, r1)?);
        let top = (v10 - v00).mul_add(tx, v00);
        let bottom = (v11 - v01).mul_add(tx, v01);

        #[allow(clippy::cast_possible_truncation)]
        let value = (bottom - top).mul_add(ty, top) as f32;
        Some(value)
    }
}

/// Shrink `gray` so its longest axis equals `max_resolution`.
///
/// Returns `None` when the image already fits, so callers can keep
/// borrowing the original without a copy.
fn downsample(gray: &GrayImage, max_resolution: u32) -> Option<GrayImage> {
    let (w, h) = (gray.width(), gray.height());
    let longest = w.max(h);
    if max_resolution == 0 || longest <= max_resolution {
        return None;
    }

    let scale = f64::from(max_resolution) / f64::from(longest);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let new_w = (f64::from(w) * scale).round().max(1.0) as u32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let new_h = (f64::from(h) * scale).round().max(1.0) as u32;

    tracing::debug!(from_w = w, from_h = h, to_w = new_w, to_h = new_h, "downsampling heightmap");
    Some(image::imageops::resize(
        gray,
        new_w,
        new_h,
        image::imageops::FilterType::Triangle,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn luminance_maps_to_unit_range() {
        let gray = GrayImage::from_raw(3, 1, vec![0, 51, 255]).unwrap();
        let hm = Heightmap::from_gray(&gray, DEFAULT_MAX_RESOLUTION).unwrap();
        assert_eq!(hm.dimensions(), Dimensions { width: 3, height: 1 });
        assert!((hm.get(0, 0).unwrap()).abs() < f32::EPSILON);
        assert!((hm.get(1, 0).unwrap() - 0.2).abs() < 1e-6);
        assert!((hm.get(2, 0).unwrap() - 1.0).abs() < f32::EPSILON);
        assert_eq!(hm.get(3, 0), None);
    }

    #[test]
    fn zero_dimension_is_geometry_error() {
        let gray = GrayImage::new(0, 5);
        assert!(matches!(
            Heightmap::from_gray(&gray, DEFAULT_MAX_RESOLUTION),
            Err(PipelineError::Geometry(_))
        ));
        assert!(matches!(
            Heightmap::from_samples(0, 0, Vec::new()),
            Err(PipelineError::Geometry(_))
        ));
    }

    #[test]
    fn from_samples_clamps() {
        let hm = Heightmap::from_samples(3, 1, vec![-1.0, 0.5, f32::NAN]).unwrap();
        assert_eq!(hm.samples(), &[0.0, 0.5, 0.0]);
    }

    #[test]
    fn from_samples_rejects_length_mismatch() {
        assert!(Heightmap::from_samples(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn large_images_are_downsampled_preserving_aspect() {
        let gray = GrayImage::from_pixel(400, 200, image::Luma([128]));
        let hm = Heightmap::from_gray(&gray, 100).unwrap();
        assert_eq!(hm.dimensions(), Dimensions { width: 100, height: 50 });
    }

    #[test]
    fn small_images_are_untouched() {
        let gray = GrayImage::from_pixel(40, 20, image::Luma([0]));
        let hm = Heightmap::from_gray(&gray, 100).unwrap();
        assert_eq!(hm.dimensions(), Dimensions { width: 40, height: 20 });
    }

    #[test]
    fn bilinear_hits_texel_centres_and_midpoints() {
        let hm = Heightmap::from_samples(2, 1, vec![0.0, 1.0]).unwrap();
        assert!((hm.sample_bilinear(0.5, 0.5).unwrap()).abs() < 1e-6);
        assert!((hm.sample_bilinear(1.5, 0.5).unwrap() - 1.0).abs() < 1e-6);
        assert!((hm.sample_bilinear(1.0, 0.5).unwrap() - 0.5).abs() < 1e-6);
        // Edge half-texel clamps to the edge value.
        assert!((hm.sample_bilinear(2.0, 1.0).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bilinear_outside_is_none() {
        let hm = Heightmap::from_samples(2, 2, vec![1.0; 4]).unwrap();
        assert_eq!(hm.sample_bilinear(-0.01, 1.0), None);
        assert_eq!(hm.sample_bilinear(1.0, 2.01), None);
    }
}
