//! Stable content fingerprint for a generation job.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::decode::ImageSource;
use crate::filter::FilterSettings;
use crate::types::CoinParameters;

/// Hash the image content, coin parameters, and filter into a 64-bit
/// fingerprint, rendered as 16 lowercase hex digits.
///
/// Identical inputs always produce the same fingerprint across processes
/// and platforms, so it can be logged and compared between workers.
#[must_use]
pub fn fingerprint(
    source: &ImageSource,
    params: &CoinParameters,
    filter: Option<&FilterSettings>,
) -> String {
    let mut h = SipHasher13::new_with_keys(0, 0);
    match source {
        ImageSource::Encoded { bytes } => {
            h.write_u8(0);
            h.write_u64(bytes.len() as u64);
            h.write(bytes);
        }
        ImageSource::Raw {
            width,
            height,
            pixels,
        } => {
            h.write_u8(1);
            h.write_u32(*width);
            h.write_u32(*height);
            h.write(pixels);
        }
    }

    h.write(params.shape.to_string().as_bytes());
    for v in [
        params.diameter_mm,
        params.thickness_mm,
        params.relief_depth_mm,
        params.scale_pct,
        params.offset_x_pct,
        params.offset_y_pct,
        params.rotation_deg,
    ] {
        h.write_u64(v.to_bits());
    }

    if let Some(f) = filter {
        h.write_u8(1);
        h.write(f.grayscale.to_string().as_bytes());
        h.write_i32(f.brightness);
        h.write_u32(f.contrast);
        h.write_u64(f.gamma.to_bits());
        h.write_u8(u8::from(f.invert));
    } else {
        h.write_u8(0);
    }

    format!("{:016x}", h.finish())
}
