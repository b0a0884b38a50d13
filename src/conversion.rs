//! Timestamp and pixel-buffer conversion helpers.
//!
//! Collaborators report timestamps in stream time-base units ("pts"); the
//! engine reasons in milliseconds and snapshot indices. The helpers here do
//! the rescaling in one place.

#[cfg(feature = "ffmpeg")]
use ffmpeg_next::frame::Video as VideoFrame;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::configuration::PixelFormat;

/// A stream time base expressed as a rational number of seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    /// Numerator.
    pub numerator: i32,
    /// Denominator.
    pub denominator: i32,
}

impl TimeBase {
    /// One tick per millisecond.
    pub const MILLISECONDS: TimeBase = TimeBase::new(1, 1_000);

    /// Create a time base of `numerator / denominator` seconds per tick.
    pub const fn new(numerator: i32, denominator: i32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Milliseconds per tick. Degenerate time bases count as one tick per
    /// millisecond.
    pub fn millis_per_tick(self) -> f64 {
        if self.numerator <= 0 || self.denominator <= 0 {
            return 1.0;
        }
        self.numerator as f64 * 1_000.0 / self.denominator as f64
    }

    /// Rescale a pts value to milliseconds.
    pub fn pts_to_millis(self, pts: i64) -> f64 {
        pts as f64 * self.millis_per_tick()
    }

    /// Rescale a millisecond span to (fractional) ticks.
    pub fn millis_to_ticks(self, millis: f64) -> f64 {
        millis / self.millis_per_tick()
    }

    /// Rescale a pts value to a seek timestamp in AV_TIME_BASE
    /// (microseconds), as container-level seeking expects.
    pub fn pts_to_micros(self, pts: i64) -> i64 {
        (self.pts_to_millis(pts) * 1_000.0) as i64
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Rational> for TimeBase {
    fn from(rational: ffmpeg_next::Rational) -> Self {
        TimeBase::new(rational.numerator(), rational.denominator())
    }
}

/// Copy pixel data from an FFmpeg video frame into a tightly-packed buffer.
///
/// `bytes_per_pixel` is the number of bytes per pixel for the output format
/// (3 for RGB24, 4 for RGBA, 1 for GRAY8).
#[cfg(feature = "ffmpeg")]
pub(crate) fn frame_to_buffer(
    video_frame: &VideoFrame,
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Vec<u8> {
    let stride = video_frame.stride(0);
    let row_bytes = (width as usize) * bytes_per_pixel;
    let data = video_frame.data(0);

    if stride == row_bytes {
        return data[..row_bytes * (height as usize)].to_vec();
    }

    let mut buffer = Vec::with_capacity(row_bytes * (height as usize));
    for row in 0..(height as usize) {
        let row_start = row * stride;
        buffer.extend_from_slice(&data[row_start..row_start + row_bytes]);
    }
    buffer
}

/// Wrap a tightly-packed pixel buffer in a [`DynamicImage`] of the given
/// format. Returns `None` when the buffer is too small.
pub fn buffer_to_image(
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Option<DynamicImage> {
    match format {
        PixelFormat::Rgb8 => RgbImage::from_raw(width, height, buffer).map(DynamicImage::ImageRgb8),
        PixelFormat::Rgba8 => {
            RgbaImage::from_raw(width, height, buffer).map(DynamicImage::ImageRgba8)
        }
        PixelFormat::Gray8 => {
            GrayImage::from_raw(width, height, buffer).map(DynamicImage::ImageLuma8)
        }
    }
}
