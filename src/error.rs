//! Error types for the `snapcache` crate.
//!
//! This module defines [`SnapcacheError`], the unified error type returned by
//! every fallible operation in the crate. Configuration errors are reported
//! synchronously and leave the engine untouched; pipeline faults never cross
//! the worker-thread boundary and only show up here when a collaborator is
//! driven directly.

use thiserror::Error;

#[cfg(feature = "ffmpeg")]
use ffmpeg_next::Error as FfmpegError;

use crate::configuration::PixelFormat;

/// The unified error type for all `snapcache` operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapcacheError {
    /// The media source could not be opened.
    #[error("Failed to open media source {url}: {reason}")]
    SourceOpen {
        /// Locator passed to [`Engine::open`](crate::Engine::open).
        url: String,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The source does not contain a decodable video stream.
    #[error("No video stream found in source")]
    NoVideoStream,

    /// The video decoder could not be created, in hardware or software.
    #[error("Failed to open video decoder: {0}")]
    DecoderOpen(String),

    /// An operation that needs an opened source was called on a closed engine.
    #[error("Engine has no opened source")]
    EngineClosed,

    /// The viewer was released, or belongs to a source that has since been closed.
    #[error("Viewer has been released")]
    ViewerReleased,

    /// The snapshot window frame count is below one.
    #[error("Invalid window frame count {0}: must be at least 1")]
    InvalidFrameCount(f64),

    /// The snapshot window size is not a positive, finite number of seconds.
    #[error("Invalid window size {0}: must be positive")]
    InvalidWindowSize(f64),

    /// The cache factor is below one.
    #[error("Invalid cache factor {0}: must be at least 1.0")]
    InvalidCacheFactor(f64),

    /// A resize factor is zero, negative or not finite.
    #[error("Invalid resize factor ({width_factor}, {height_factor}): both must be positive")]
    InvalidResizeFactor {
        /// Horizontal factor.
        width_factor: f64,
        /// Vertical factor.
        height_factor: f64,
    },

    /// A snapshot dimension of zero was requested.
    #[error("Invalid snapshot size {width}x{height}")]
    InvalidSnapshotSize {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// The frame converter cannot produce the requested pixel format.
    #[error("Unsupported snapshot color format: {0:?}")]
    UnsupportedColorFormat(PixelFormat),

    /// Reading or seeking the compressed stream failed.
    #[error("Demux error: {0}")]
    Demux(String),

    /// Feeding the decoder or draining it failed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Converting a decoded frame into an image failed.
    #[error("Frame conversion error: {0}")]
    Convert(String),

    /// A worker thread could not be spawned.
    #[error("Failed to spawn {name} thread: {reason}")]
    ThreadSpawn {
        /// Thread name.
        name: &'static str,
        /// OS error message.
        reason: String,
    },

    /// An error originating from the FFmpeg libraries.
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),
}

#[cfg(feature = "ffmpeg")]
impl From<FfmpegError> for SnapcacheError {
    fn from(error: FfmpegError) -> Self {
        SnapcacheError::FfmpegError(error.to_string())
    }
}
