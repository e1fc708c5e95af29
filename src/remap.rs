use crate::types::{DisplayFrame, RawDepthFrame};
use crate::{DepthError, Result};
use std::time::Duration;

/// Distance mapped to full brightness, in millimeters.
pub const FAR_CLIP_MM: u32 = 5_000;

/// Spatial downsample factor in both axes.
pub const DOWNSAMPLE: usize = 2;

/// Map one depth sample to display luminance.
///
/// `lum = d * 255 / 5000`, rounded half-up and saturated at 255. A reading of
/// 0 mm is the sensor's "no return" value and shows as black, the same as an
/// object touching the sensor.
#[inline]
pub fn luminance(depth_mm: u16) -> u8 {
    let scaled = (depth_mm as u32 * 255 + FAR_CLIP_MM / 2) / FAR_CLIP_MM;
    scaled.min(255) as u8
}

/// Downsample and remap a raw frame into a freshly allocated display frame.
pub fn remap(raw: &RawDepthFrame) -> DisplayFrame {
    let mut out = DisplayFrame::for_raw(raw.width(), raw.height());
    write_pixels(raw, &mut out);
    out
}

/// Downsample and remap into an existing display buffer.
///
/// The buffer must have been allocated for raw frames of exactly this size.
pub fn remap_into(raw: &RawDepthFrame, out: &mut DisplayFrame) -> Result<()> {
    let (expected_width, expected_height) = out.source_size();
    if raw.width() != expected_width || raw.height() != expected_height {
        return Err(DepthError::DimensionChanged {
            expected_width,
            expected_height,
            actual_width: raw.width(),
            actual_height: raw.height(),
        });
    }
    write_pixels(raw, out);
    Ok(())
}

fn write_pixels(raw: &RawDepthFrame, out: &mut DisplayFrame) {
    let raw_width = raw.width();
    let samples = raw.samples();
    let (width, height) = (out.width(), out.height());
    let stride = out.stride();
    let pixels = out.pixels_mut();

    for oy in 0..height {
        let src = &samples[oy * DOWNSAMPLE * raw_width..];
        let dst = &mut pixels[oy * stride..(oy + 1) * stride];
        for (ox, px) in dst.chunks_exact_mut(3).enumerate().take(width) {
            let lum = luminance(src[ox * DOWNSAMPLE]);
            px.copy_from_slice(&[lum, lum, lum]);
        }
    }
}

/// Format elapsed capture time as `hh:mm:ss.fffffff`.
///
/// Seven fractional digits (100 ns ticks); a `d.` day prefix appears once a
/// full day has elapsed.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let ticks = elapsed.subsec_nanos() / 100;
    let days = total_secs / 86_400;
    let hours = (total_secs / 3_600) % 24;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    if days > 0 {
        format!(
            "{}.{:02}:{:02}:{:02}.{:07}",
            days, hours, minutes, seconds, ticks
        )
    } else {
        format!("{:02}:{:02}:{:02}.{:07}", hours, minutes, seconds, ticks)
    }
}
