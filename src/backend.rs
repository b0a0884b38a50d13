//! Media collaborator traits.
//!
//! The engine never parses containers, decodes bitstreams, or scales pixels
//! itself. It drives three collaborators obtained from a [`MediaBackend`]:
//!
//! - a [`Demuxer`], which seeks and yields compressed packets,
//! - a [`VideoDecoder`], which turns packets into frames,
//! - a [`FrameConverter`], which turns frames into [`DynamicImage`] snapshots.
//!
//! Each collaborator is owned by exactly one worker thread while the
//! pipeline runs, so implementations only need to be [`Send`].
//!
//! The FFmpeg implementation lives in [`crate::ffmpeg`] (feature `ffmpeg`).

use std::fmt::{Debug, Formatter, Result as FmtResult};

use image::DynamicImage;

use crate::configuration::{DecoderOptions, PixelFormat, ResolvedOutput};
use crate::conversion::TimeBase;
use crate::error::SnapcacheError;

/// Immutable description of an opened video source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    /// Locator the source was opened from.
    pub url: String,
    /// Index of the video stream packets are filtered on.
    pub video_stream_index: usize,
    /// Total duration in milliseconds.
    pub duration_ms: f64,
    /// Ideal time between two frames, in milliseconds.
    pub frame_interval_ms: f64,
    /// Total frame count (estimated from duration and frame rate when the
    /// container does not record it).
    pub frame_count: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Time base of every pts the collaborators report.
    pub time_base: TimeBase,
    /// Pts of the first frame.
    pub start_pts: i64,
    /// Keyframe pts values in ascending order.
    pub keyframes: Vec<i64>,
    /// Codec name (e.g. `"h264"`).
    pub codec: String,
    /// Whether the decoder negotiated hardware acceleration.
    pub hardware_accelerated: bool,
}

impl SourceInfo {
    /// Frames per second derived from the frame interval.
    pub fn frames_per_second(&self) -> f64 {
        if self.frame_interval_ms > 0.0 {
            1_000.0 / self.frame_interval_ms
        } else {
            0.0
        }
    }

    /// Duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.duration_ms / 1_000.0
    }
}

/// A compressed packet read by a [`Demuxer`].
#[derive(Debug)]
pub struct DemuxedPacket<P> {
    /// Stream the packet belongs to.
    pub stream_index: usize,
    /// Presentation timestamp, in [`SourceInfo::time_base`] units. Packets
    /// without a pts carry their dts.
    pub pts: i64,
    /// Whether the packet starts a keyframe.
    pub is_key: bool,
    /// Backend-specific payload.
    pub payload: P,
}

/// A decoded, not yet converted, frame produced by a [`VideoDecoder`].
#[derive(Debug)]
pub struct DecodedFrame<F> {
    /// Presentation timestamp, in [`SourceInfo::time_base`] units.
    pub pts: i64,
    /// Backend-specific payload.
    pub payload: F,
}

/// Reads compressed packets from the source.
pub trait Demuxer<P>: Send {
    /// Reposition so the next packet read is the keyframe at or before `pts`.
    fn seek(&mut self, pts: i64) -> Result<(), SnapcacheError>;

    /// Read the next packet of any stream. `Ok(None)` signals end of input.
    fn read_packet(&mut self) -> Result<Option<DemuxedPacket<P>>, SnapcacheError>;
}

/// Push/pull video decoder.
pub trait VideoDecoder<P, F>: Send {
    /// Submit one compressed packet.
    fn send_packet(&mut self, packet: DemuxedPacket<P>) -> Result<(), SnapcacheError>;

    /// Signal end of stream so buffered frames can be drained.
    fn send_eof(&mut self) -> Result<(), SnapcacheError>;

    /// Pull the next decoded frame. `Ok(None)` means the decoder needs more
    /// input (or is fully drained after [`send_eof`](VideoDecoder::send_eof)).
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame<F>>, SnapcacheError>;

    /// Drop all buffered state so decoding can restart at a new keyframe.
    fn flush(&mut self);

    /// Whether frames are decoded on a hardware device.
    fn is_hardware_accelerated(&self) -> bool {
        false
    }
}

/// Converts decoded frames into normalized snapshot images.
pub trait FrameConverter<F>: Send {
    /// Convert `frame` to the given output size, format and filter.
    fn convert(&mut self, frame: &F, output: &ResolvedOutput)
    -> Result<DynamicImage, SnapcacheError>;

    /// Whether the converter can produce `format`.
    fn supports(&self, format: PixelFormat) -> bool {
        let _ = format;
        true
    }
}

/// The three collaborators of one opened source, plus its description.
///
/// Returned by [`MediaBackend::open`], or assembled by hand and passed to
/// [`Engine::open_media`](crate::Engine::open_media) when the caller already
/// holds a parsed source.
pub struct OpenedMedia<P, F> {
    /// Source description.
    pub info: SourceInfo,
    /// Packet reader.
    pub demuxer: Box<dyn Demuxer<P>>,
    /// Video decoder.
    pub decoder: Box<dyn VideoDecoder<P, F>>,
    /// Frame converter.
    pub converter: Box<dyn FrameConverter<F>>,
}

impl<P, F> Debug for OpenedMedia<P, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("OpenedMedia")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Factory for [`OpenedMedia`].
pub trait MediaBackend: Send + Sync + 'static {
    /// Compressed packet payload.
    type Packet: Send + 'static;
    /// Decoded frame payload.
    type Frame: Send + 'static;

    /// Open `url`, scan its keyframes, and negotiate a decoder.
    ///
    /// Hardware decoder failures must be retried in software before an
    /// error is returned.
    fn open(
        &self,
        url: &str,
        options: &DecoderOptions,
    ) -> Result<OpenedMedia<Self::Packet, Self::Frame>, SnapcacheError>;
}

/// Open a decoder, trying `hardware` first when given.
///
/// A failed hardware attempt is logged and retried with `software`; only the
/// software error is ever returned. The flag reports whether the hardware
/// attempt won.
#[cfg_attr(not(feature = "ffmpeg"), allow(dead_code))]
pub(crate) fn open_with_software_fallback<D, H, S>(
    hardware: Option<H>,
    software: S,
) -> Result<(D, bool), SnapcacheError>
where
    H: FnOnce() -> Result<D, SnapcacheError>,
    S: FnOnce() -> Result<D, SnapcacheError>,
{
    if let Some(hardware) = hardware {
        match hardware() {
            Ok(decoder) => return Ok((decoder, true)),
            Err(error) => log::debug!("{error}; decoding in software"),
        }
    }
    software().map(|decoder| (decoder, false))
}
