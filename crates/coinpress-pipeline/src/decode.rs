//! Image sources and decoding to a single luminance channel.

use std::io::Cursor;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::filter::{self, FilterSettings};
use crate::types::{Dimensions, PipelineError};

/// The pixels a job starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImageSource {
    /// An encoded image file (PNG, JPEG, BMP, WebP).
    Encoded {
        /// The file contents.
        bytes: Vec<u8>,
    },
    /// An already-filtered 8-bit luminance buffer in row-major order.
    Raw {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// `width * height` samples.
        pixels: Vec<u8>,
    },
}

impl ImageSource {
    /// Wrap encoded file bytes.
    #[must_use]
    pub const fn encoded(bytes: Vec<u8>) -> Self {
        Self::Encoded { bytes }
    }

    /// Read the image dimensions without decoding the pixel data.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyInput`] for empty encoded input,
    /// [`PipelineError::ImageDecode`] when the header is unreadable, and
    /// [`PipelineError::MalformedRaw`] when a raw buffer's length does not
    /// match its declared size.
    pub fn probe(&self) -> Result<Dimensions, PipelineError> {
        match self {
            Self::Encoded { bytes } => {
                if bytes.is_empty() {
                    return Err(PipelineError::EmptyInput);
                }
                let (width, height) = image::ImageReader::new(Cursor::new(bytes))
                    .with_guessed_format()
                    .map_err(image::ImageError::IoError)?
                    .into_dimensions()?;
                Ok(Dimensions { width, height })
            }
            Self::Raw {
                width,
                height,
                pixels,
            } => {
                let dims = Dimensions {
                    width: *width,
                    height: *height,
                };
                if u64::try_from(pixels.len()).ok() != Some(dims.pixel_count()) {
                    return Err(PipelineError::MalformedRaw(format!(
                        "{} samples for a {width}x{height} image",
                        pixels.len()
                    )));
                }
                Ok(dims)
            }
        }
    }

    /// Number of bytes carried by the source.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Encoded { bytes } => bytes.len(),
            Self::Raw { pixels, .. } => pixels.len(),
        }
    }

    /// Raw content, used for fingerprinting.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Encoded { bytes } => bytes,
            Self::Raw { pixels, .. } => pixels,
        }
    }
}

/// Decode a source into gray samples, applying `settings` when given.
///
/// Raw buffers are already single-channel, so the grayscale method is
/// ignored for them but the tonal adjustments still apply.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`], [`PipelineError::ImageDecode`],
/// or [`PipelineError::MalformedRaw`] for unusable input.
#[must_use = "returns the decoded grayscale image"]
pub fn decode(
    source: &ImageSource,
    settings: Option<&FilterSettings>,
) -> Result<GrayImage, PipelineError> {
    let gray = match source {
        ImageSource::Encoded { bytes } => {
            if bytes.is_empty() {
                return Err(PipelineError::EmptyInput);
            }
            let img = image::load_from_memory(bytes)?;
            match settings {
                Some(s) => filter::to_gray(&img.to_rgba8(), s.grayscale),
                None => img.to_luma8(),
            }
        }
        ImageSource::Raw {
            width,
            height,
            pixels,
        } => GrayImage::from_raw(*width, *height, pixels.clone()).ok_or_else(|| {
            PipelineError::MalformedRaw(format!(
                "{} samples for a {width}x{height} image",
                pixels.len()
            ))
        })?,
    };

    Ok(match settings {
        Some(s) => filter::adjust(&gray, s),
        None => gray,
    })
}
