//! Engine and snapshot output configuration.
//!
//! [`EngineOptions`] is a builder that carries the tuning knobs of the
//! snapshot pipeline (cache factor, queue depths, backpressure bounds, idle
//! sleep) plus the decoder and output settings, without polluting every
//! constructor signature.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use snapcache::{EngineOptions, InterpolationMode, PixelFormat, SnapshotOutputOptions};
//!
//! let options = EngineOptions::new()
//!     .with_cache_factor(3.0)
//!     .with_idle_sleep(Duration::from_millis(2))
//!     .with_output(
//!         SnapshotOutputOptions::new()
//!             .with_pixel_format(PixelFormat::Rgba8)
//!             .with_resolution(Some(160), None)
//!             .with_interpolation(InterpolationMode::Area),
//!     );
//! assert_eq!(options.cache_factor(), 3.0);
//! ```

use std::time::Duration;

#[cfg(feature = "ffmpeg")]
use ffmpeg_next::{format::Pixel, software::scaling::Flags as ScalingFlags};
use image::imageops::FilterType;

/// Output pixel format for snapshots.
///
/// Controls the colour model and depth of the [`image::DynamicImage`] values
/// the convert stage produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 8-bit RGB (24 bpp).
    Rgb8,
    /// 8-bit RGBA with alpha pre-set to 255 (32 bpp). This is the default,
    /// since most texture APIs want four channels.
    #[default]
    Rgba8,
    /// 8-bit grayscale (8 bpp).
    Gray8,
}

impl PixelFormat {
    /// Every supported format.
    pub const ALL: [PixelFormat; 3] = [PixelFormat::Rgb8, PixelFormat::Rgba8, PixelFormat::Gray8];

    /// Number of bytes per pixel in the packed output buffer.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Map to the corresponding FFmpeg pixel format constant.
    #[cfg(feature = "ffmpeg")]
    pub(crate) fn to_ffmpeg_pixel(self) -> Pixel {
        match self {
            PixelFormat::Rgb8 => Pixel::RGB24,
            PixelFormat::Rgba8 => Pixel::RGBA,
            PixelFormat::Gray8 => Pixel::GRAY8,
        }
    }
}

/// Resampling filter used when a frame is scaled to snapshot size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpolationMode {
    /// Nearest neighbour. Fastest, blocky.
    Nearest,
    /// Bilinear. This is the default.
    #[default]
    Bilinear,
    /// Bicubic.
    Bicubic,
    /// Area averaging. Best for strong downscaling.
    Area,
}

impl InterpolationMode {
    /// Map to the closest `image` crate resampling filter.
    pub fn to_filter_type(self) -> FilterType {
        match self {
            InterpolationMode::Nearest => FilterType::Nearest,
            InterpolationMode::Bilinear => FilterType::Triangle,
            InterpolationMode::Bicubic => FilterType::CatmullRom,
            InterpolationMode::Area => FilterType::Gaussian,
        }
    }

    /// Map to the corresponding swscale flag.
    #[cfg(feature = "ffmpeg")]
    pub(crate) fn to_scaling_flags(self) -> ScalingFlags {
        match self {
            InterpolationMode::Nearest => ScalingFlags::POINT,
            InterpolationMode::Bilinear => ScalingFlags::BILINEAR,
            InterpolationMode::Bicubic => ScalingFlags::BICUBIC,
            InterpolationMode::Area => ScalingFlags::AREA,
        }
    }
}

/// Snapshot output settings.
///
/// Resolution is chosen, in order of precedence, from an explicit size
/// ([`with_resolution`](SnapshotOutputOptions::with_resolution)), or from a
/// resize factor applied to the source size
/// ([`with_resize_factor`](SnapshotOutputOptions::with_resize_factor)).
/// Setting only one explicit dimension together with
/// [`maintain_aspect_ratio`](SnapshotOutputOptions::maintain_aspect_ratio)
/// computes the other dimension from the source aspect ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOutputOptions {
    /// Output pixel format.
    pub pixel_format: PixelFormat,
    /// Target width. `None` derives it from the resize factor.
    pub width: Option<u32>,
    /// Target height. `None` derives it from the resize factor.
    pub height: Option<u32>,
    /// Horizontal scale applied to the source width when no width is set.
    pub width_factor: f64,
    /// Vertical scale applied to the source height when no height is set.
    pub height_factor: f64,
    /// When `true` and only one dimension is specified, the other is
    /// computed to preserve the source aspect ratio.
    pub maintain_aspect_ratio: bool,
    /// Resampling filter.
    pub interpolation: InterpolationMode,
}

impl Default for SnapshotOutputOptions {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Rgba8,
            width: None,
            height: None,
            width_factor: 1.0,
            height_factor: 1.0,
            maintain_aspect_ratio: true,
            interpolation: InterpolationMode::Bilinear,
        }
    }
}

impl SnapshotOutputOptions {
    /// Create output options with default settings (source size, RGBA8,
    /// bilinear).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output pixel format.
    #[must_use]
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Set an explicit output resolution.
    ///
    /// Pass `None` for either dimension to derive it from the resize factor
    /// (or from the aspect ratio when only one dimension is given).
    #[must_use]
    pub fn with_resolution(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the resize factors applied to the source size.
    #[must_use]
    pub fn with_resize_factor(mut self, width_factor: f64, height_factor: f64) -> Self {
        self.width_factor = width_factor;
        self.height_factor = height_factor;
        self
    }

    /// Control whether aspect ratio is preserved when only one output
    /// dimension is specified. Defaults to `true`.
    #[must_use]
    pub fn with_maintain_aspect_ratio(mut self, maintain: bool) -> Self {
        self.maintain_aspect_ratio = maintain;
        self
    }

    /// Set the resampling filter.
    #[must_use]
    pub fn with_interpolation(mut self, mode: InterpolationMode) -> Self {
        self.interpolation = mode;
        self
    }

    /// Resolve the final output settings given the source size.
    pub fn resolve(&self, source_width: u32, source_height: u32) -> ResolvedOutput {
        let (width, height) = self.resolve_dimensions(source_width, source_height);
        ResolvedOutput {
            width,
            height,
            pixel_format: self.pixel_format,
            interpolation: self.interpolation,
        }
    }

    fn resolve_dimensions(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        let scaled = |size: u32, factor: f64| ((size as f64 * factor).round() as u32).max(1);
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) if self.maintain_aspect_ratio && source_width > 0 => {
                let ratio = w as f64 / source_width as f64;
                (w, scaled(source_height, ratio))
            }
            (Some(w), None) => (w, scaled(source_height, self.height_factor)),
            (None, Some(h)) if self.maintain_aspect_ratio && source_height > 0 => {
                let ratio = h as f64 / source_height as f64;
                (scaled(source_width, ratio), h)
            }
            (None, Some(h)) => (scaled(source_width, self.width_factor), h),
            (None, None) => (
                scaled(source_width, self.width_factor),
                scaled(source_height, self.height_factor),
            ),
        }
    }
}

/// Output settings after resolution against the source size.
///
/// This is what a [`FrameConverter`](crate::FrameConverter) receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOutput {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Output pixel format.
    pub pixel_format: PixelFormat,
    /// Resampling filter.
    pub interpolation: InterpolationMode,
}

/// Decoder negotiation settings handed to the media backend on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Try hardware decoding first. Failures fall back to software silently.
    pub hardware_acceleration: bool,
    /// Decoder thread count hint. `None` lets the backend decide.
    pub threads: Option<usize>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            hardware_acceleration: true,
            threads: None,
        }
    }
}

/// Configuration for an [`Engine`](crate::Engine).
///
/// All fields have sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub(crate) cache_factor: f64,
    pub(crate) packet_queue_depth: usize,
    pub(crate) max_pending_frames: usize,
    pub(crate) max_demuxed_tasks: usize,
    pub(crate) idle_sleep: Duration,
    pub(crate) window_size: Duration,
    pub(crate) window_frame_count: f64,
    pub(crate) decoder: DecoderOptions,
    pub(crate) output: SnapshotOutputOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineOptions {
    /// Create a new configuration with default settings.
    ///
    /// Defaults: cache factor 4, packet queue depth 64, 32 in-flight frames,
    /// 4 demuxed-but-undecoded tasks, 5 ms idle sleep, and a 10 second
    /// window showing 10 snapshots.
    pub fn new() -> Self {
        Self {
            cache_factor: 4.0,
            packet_queue_depth: 64,
            max_pending_frames: 32,
            max_demuxed_tasks: 4,
            idle_sleep: Duration::from_millis(5),
            window_size: Duration::from_secs(10),
            window_frame_count: 10.0,
            decoder: DecoderOptions::default(),
            output: SnapshotOutputOptions::default(),
        }
    }

    /// Set the cache factor: the cache window holds `frame_count *
    /// factor` snapshots. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_cache_factor(mut self, factor: f64) -> Self {
        self.cache_factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    /// Set how many compressed packets a task may queue before demuxing
    /// pauses. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_packet_queue_depth(mut self, depth: usize) -> Self {
        self.packet_queue_depth = depth.max(1);
        self
    }

    /// Set how many decoded-but-unconverted frames may exist at once.
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_max_pending_frames(mut self, count: usize) -> Self {
        self.max_pending_frames = count.max(1);
        self
    }

    /// Set how many fully demuxed tasks may wait for the decoder before
    /// demuxing pauses. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_max_demuxed_tasks(mut self, count: usize) -> Self {
        self.max_demuxed_tasks = count.max(1);
        self
    }

    /// Set how long an idle worker thread sleeps before polling again.
    #[must_use]
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Set the snapshot window applied when a source is opened. Both values
    /// are validated and clamped on open, like
    /// [`Engine::config_snap_window`](crate::Engine::config_snap_window).
    #[must_use]
    pub fn with_snap_window(mut self, window_size: Duration, frame_count: f64) -> Self {
        self.window_size = window_size;
        self.window_frame_count = frame_count;
        self
    }

    /// Set the decoder negotiation settings.
    #[must_use]
    pub fn with_decoder(mut self, decoder: DecoderOptions) -> Self {
        self.decoder = decoder;
        self
    }

    /// Enable or disable hardware decoding.
    #[must_use]
    pub fn with_hardware_acceleration(mut self, enabled: bool) -> Self {
        self.decoder.hardware_acceleration = enabled;
        self
    }

    /// Set the snapshot output settings.
    #[must_use]
    pub fn with_output(mut self, output: SnapshotOutputOptions) -> Self {
        self.output = output;
        self
    }

    /// The configured cache factor.
    pub fn cache_factor(&self) -> f64 {
        self.cache_factor
    }

    /// The configured snapshot output settings.
    pub fn output(&self) -> &SnapshotOutputOptions {
        &self.output
    }

    /// The configured decoder settings.
    pub fn decoder(&self) -> &DecoderOptions {
        &self.decoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults_to_source_size() {
        let output = SnapshotOutputOptions::new().resolve(1920, 1080);
        assert_eq!((output.width, output.height), (1920, 1080));
        assert_eq!(output.pixel_format, PixelFormat::Rgba8);
    }

    #[test]
    fn resolve_applies_resize_factor() {
        let output = SnapshotOutputOptions::new()
            .with_resize_factor(0.125, 0.25)
            .resolve(1920, 1080);
        assert_eq!((output.width, output.height), (240, 270));
    }

    #[test]
    fn resolve_keeps_aspect_ratio_for_single_dimension() {
        let output = SnapshotOutputOptions::new()
            .with_resolution(Some(160), None)
            .resolve(1920, 1080);
        assert_eq!((output.width, output.height), (160, 90));
    }

    #[test]
    fn cache_factor_is_clamped() {
        assert_eq!(EngineOptions::new().with_cache_factor(0.2).cache_factor(), 1.0);
        assert_eq!(
            EngineOptions::new().with_cache_factor(f64::NAN).cache_factor(),
            1.0
        );
    }
}
