//! FFmpeg media backend.
//!
//! [`FfmpegBackend`] opens a source with `ffmpeg-next`, scans the video
//! stream's keyframes without decoding, and returns the three collaborators
//! the engine drives:
//!
//! - [`FfmpegDemuxer`] reads packets and seeks by pts,
//! - [`FfmpegDecoder`] decodes them, on hardware when the `hardware` feature
//!   is enabled and a device is available,
//! - [`FfmpegConverter`] scales and converts frames with swscale.
//!
//! FFmpeg has its own internal logging, separate from the [`log`] crate. Use
//! [`set_ffmpeg_log_level`] to silence or tune it.
//!
//! # Example
//!
//! ```no_run
//! use snapcache::{Engine, FfmpegBackend, FfmpegLogLevel};
//!
//! snapcache::set_ffmpeg_log_level(FfmpegLogLevel::Error);
//!
//! let mut engine = Engine::new(FfmpegBackend::new());
//! engine.open("input.mp4")?;
//! # Ok::<(), snapcache::SnapcacheError>(())
//! ```

use ffmpeg_next::{
    Error as FfmpegError, Packet, Rational,
    codec::{
        Parameters, context::Context as CodecContext, decoder::Video as FfmpegVideoDecoder,
        threading,
    },
    format::{self, Pixel, context::Input},
    frame::Video as VideoFrame,
    media::Type,
    software::scaling::Context as ScalingContext,
    util::log::Level,
};
use image::DynamicImage;

use crate::backend::{
    DecodedFrame, DemuxedPacket, Demuxer, FrameConverter, MediaBackend, OpenedMedia, SourceInfo,
    VideoDecoder, open_with_software_fallback,
};
use crate::configuration::{DecoderOptions, ResolvedOutput};
use crate::conversion::{TimeBase, buffer_to_image, frame_to_buffer};
use crate::error::SnapcacheError;

/// FFmpeg internal log verbosity level.
///
/// Maps directly to FFmpeg's `AV_LOG_*` constants. Setting a level causes
/// FFmpeg to suppress all messages below that severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfmpegLogLevel {
    /// Print no output at all.
    Quiet,
    /// Only unrecoverable conditions that abort the process.
    Panic,
    /// Only unrecoverable errors.
    Fatal,
    /// Recoverable errors.
    Error,
    /// Warnings (FFmpeg's default).
    Warning,
    /// Informational messages.
    Info,
    /// Verbose informational messages.
    Verbose,
    /// Debugging messages.
    Debug,
    /// Extremely verbose tracing output.
    Trace,
}

impl FfmpegLogLevel {
    fn to_ffmpeg_level(self) -> Level {
        match self {
            FfmpegLogLevel::Quiet => Level::Quiet,
            FfmpegLogLevel::Panic => Level::Panic,
            FfmpegLogLevel::Fatal => Level::Fatal,
            FfmpegLogLevel::Error => Level::Error,
            FfmpegLogLevel::Warning => Level::Warning,
            FfmpegLogLevel::Info => Level::Info,
            FfmpegLogLevel::Verbose => Level::Verbose,
            FfmpegLogLevel::Debug => Level::Debug,
            FfmpegLogLevel::Trace => Level::Trace,
        }
    }

    fn from_ffmpeg_level(level: Level) -> Self {
        match level {
            Level::Quiet => FfmpegLogLevel::Quiet,
            Level::Panic => FfmpegLogLevel::Panic,
            Level::Fatal => FfmpegLogLevel::Fatal,
            Level::Error => FfmpegLogLevel::Error,
            Level::Warning => FfmpegLogLevel::Warning,
            Level::Info => FfmpegLogLevel::Info,
            Level::Verbose => FfmpegLogLevel::Verbose,
            Level::Debug => FfmpegLogLevel::Debug,
            Level::Trace => FfmpegLogLevel::Trace,
        }
    }
}

/// Set FFmpeg's own stderr verbosity. Does not affect `log` output.
pub fn set_ffmpeg_log_level(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level.to_ffmpeg_level());
}

/// Current FFmpeg stderr verbosity.
pub fn get_ffmpeg_log_level() -> Option<FfmpegLogLevel> {
    ffmpeg_next::util::log::get_level()
        .ok()
        .map(FfmpegLogLevel::from_ffmpeg_level)
}

/// Opens sources with FFmpeg.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    type Packet = Packet;
    type Frame = VideoFrame;

    fn open(
        &self,
        url: &str,
        options: &DecoderOptions,
    ) -> Result<OpenedMedia<Packet, VideoFrame>, SnapcacheError> {
        let open_error = |reason: String| SnapcacheError::SourceOpen {
            url: url.to_string(),
            reason,
        };

        ffmpeg_next::init()
            .map_err(|error| open_error(format!("FFmpeg initialisation failed: {error}")))?;

        let mut scan_input = format::input(&url).map_err(|error| open_error(error.to_string()))?;
        let container_duration_micros = scan_input.duration();
        let (video_stream_index, stream_time_base, stream_start, stream_duration, stream_frames, frame_rate, parameters) = {
            let stream = scan_input
                .streams()
                .best(Type::Video)
                .ok_or(SnapcacheError::NoVideoStream)?;
            let frame_rate = if stream.avg_frame_rate().denominator() != 0 {
                stream.avg_frame_rate()
            } else {
                stream.rate()
            };
            (
                stream.index(),
                stream.time_base(),
                stream.start_time(),
                stream.duration(),
                stream.frames(),
                frame_rate,
                stream.parameters().clone(),
            )
        };

        let time_base = TimeBase::from(stream_time_base);
        let frames_per_second = rational_to_f64(frame_rate);
        if frames_per_second <= 0.0 {
            return Err(open_error("video stream reports no frame rate".to_string()));
        }
        let frame_interval_ms = 1_000.0 / frames_per_second;
        let start_pts = if stream_start == ffmpeg_sys_next::AV_NOPTS_VALUE {
            0
        } else {
            stream_start
        };
        let duration_ms = if stream_duration > 0 {
            time_base.pts_to_millis(stream_duration)
        } else {
            container_duration_micros.max(0) as f64 / 1_000.0
        };
        let frame_count = if stream_frames > 0 {
            stream_frames as u64
        } else {
            (duration_ms / frame_interval_ms) as u64
        };

        let keyframes = scan_keyframes(&mut scan_input, video_stream_index)?;
        drop(scan_input);

        let decoder = FfmpegDecoder::open(&parameters, options)?;
        let width = decoder.decoder.width();
        let height = decoder.decoder.height();
        let codec = decoder
            .decoder
            .codec()
            .map(|codec| codec.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let input = format::input(&url).map_err(|error| open_error(error.to_string()))?;
        let info = SourceInfo {
            url: url.to_string(),
            video_stream_index,
            duration_ms,
            frame_interval_ms,
            frame_count,
            width,
            height,
            time_base,
            start_pts,
            keyframes,
            codec,
            hardware_accelerated: decoder.hardware,
        };

        Ok(OpenedMedia {
            info,
            demuxer: Box::new(FfmpegDemuxer { input, time_base }),
            decoder: Box::new(decoder),
            converter: Box::new(FfmpegConverter::default()),
        })
    }
}

fn rational_to_f64(rational: Rational) -> f64 {
    if rational.denominator() == 0 {
        0.0
    } else {
        rational.numerator() as f64 / rational.denominator() as f64
    }
}

/// Collect the pts of every keyframe packet of the video stream.
///
/// Reads packets without decoding, so it is fast even for long sources.
fn scan_keyframes(input: &mut Input, video_stream_index: usize) -> Result<Vec<i64>, SnapcacheError> {
    log::debug!("Scanning keyframes (stream={video_stream_index})");
    let mut keyframes = Vec::new();
    let mut video_packets: u64 = 0;

    let mut packet = Packet::empty();
    loop {
        match packet.read(input) {
            Ok(()) => {
                if packet.stream() != video_stream_index {
                    continue;
                }
                video_packets += 1;
                if packet.is_key() {
                    if let Some(pts) = packet.pts().or(packet.dts()) {
                        keyframes.push(pts);
                    }
                }
            }
            Err(FfmpegError::Eof) => break,
            Err(error) => return Err(SnapcacheError::from(error)),
        }
    }

    keyframes.sort_unstable();
    log::debug!(
        "Found {} keyframe(s) in {video_packets} video packet(s)",
        keyframes.len()
    );
    Ok(keyframes)
}

/// Packet reader over an FFmpeg input context.
pub struct FfmpegDemuxer {
    input: Input,
    time_base: TimeBase,
}

impl Demuxer<Packet> for FfmpegDemuxer {
    fn seek(&mut self, pts: i64) -> Result<(), SnapcacheError> {
        let timestamp = self.time_base.pts_to_micros(pts);
        self.input
            .seek(timestamp, ..timestamp)
            .map_err(|error| SnapcacheError::Demux(format!("seek to pts {pts} failed: {error}")))
    }

    fn read_packet(&mut self) -> Result<Option<DemuxedPacket<Packet>>, SnapcacheError> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(DemuxedPacket {
                stream_index: packet.stream(),
                pts: packet.pts().or(packet.dts()).unwrap_or(i64::MIN),
                is_key: packet.is_key(),
                payload: packet,
            })),
            Err(FfmpegError::Eof) => Ok(None),
            Err(error) => Err(SnapcacheError::Demux(error.to_string())),
        }
    }
}

/// Video decoder, on hardware when negotiated.
pub struct FfmpegDecoder {
    decoder: FfmpegVideoDecoder,
    hardware: bool,
}

impl FfmpegDecoder {
    /// Open a decoder for the stream described by `parameters`. Every
    /// attempt gets its own codec context, so a hardware attempt that fails
    /// while opening leaves nothing half-configured for the software one.
    fn open(parameters: &Parameters, options: &DecoderOptions) -> Result<Self, SnapcacheError> {
        let codec_context = || -> Result<CodecContext, SnapcacheError> {
            let mut codec_context =
                CodecContext::from_parameters(parameters.clone()).map_err(|error| {
                    SnapcacheError::DecoderOpen(format!(
                        "Failed to read video codec parameters: {error}"
                    ))
                })?;
            if let Some(threads) = options.threads {
                codec_context.set_threading(threading::Config::count(threads));
            }
            Ok(codec_context)
        };
        let software = || {
            codec_context()?
                .decoder()
                .video()
                .map_err(|error| SnapcacheError::DecoderOpen(error.to_string()))
        };

        let (decoder, hardware) = open_with_software_fallback(
            hardware_attempt(&codec_context, options.hardware_acceleration),
            software,
        )?;
        Ok(Self { decoder, hardware })
    }

    #[cfg(feature = "hardware")]
    fn download(&self, frame: VideoFrame) -> VideoFrame {
        if !self.hardware {
            return frame;
        }
        crate::hardware_acceleration::transfer_hardware_frame(&frame).unwrap_or(frame)
    }

    #[cfg(not(feature = "hardware"))]
    fn download(&self, frame: VideoFrame) -> VideoFrame {
        frame
    }
}

#[cfg(feature = "hardware")]
fn hardware_attempt<C>(
    codec_context: &C,
    hardware_acceleration: bool,
) -> Option<impl FnOnce() -> Result<FfmpegVideoDecoder, SnapcacheError> + '_>
where
    C: Fn() -> Result<CodecContext, SnapcacheError>,
{
    hardware_acceleration
        .then(|| move || crate::hardware_acceleration::open_hardware_decoder(codec_context()?))
}

#[cfg(not(feature = "hardware"))]
fn hardware_attempt<C>(
    _codec_context: &C,
    hardware_acceleration: bool,
) -> Option<fn() -> Result<FfmpegVideoDecoder, SnapcacheError>>
where
    C: Fn() -> Result<CodecContext, SnapcacheError>,
{
    if hardware_acceleration {
        log::debug!("Built without the `hardware` feature; decoding in software");
    }
    None
}

impl VideoDecoder<Packet, VideoFrame> for FfmpegDecoder {
    fn send_packet(&mut self, packet: DemuxedPacket<Packet>) -> Result<(), SnapcacheError> {
        match self.decoder.send_packet(&packet.payload) {
            Ok(()) => Ok(()),
            Err(FfmpegError::InvalidData) => {
                log::warn!("Skipping corrupt packet at pts {}", packet.pts);
                Ok(())
            }
            Err(error) => Err(SnapcacheError::Decode(error.to_string())),
        }
    }

    fn send_eof(&mut self) -> Result<(), SnapcacheError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(FfmpegError::Eof) => Ok(()),
            Err(error) => Err(SnapcacheError::Decode(error.to_string())),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame<VideoFrame>>, SnapcacheError> {
        loop {
            let mut frame = VideoFrame::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let Some(pts) = frame.timestamp().or(frame.pts()) else {
                        log::trace!("Skipping decoded frame without timestamp");
                        continue;
                    };
                    return Ok(Some(DecodedFrame {
                        pts,
                        payload: self.download(frame),
                    }));
                }
                Err(FfmpegError::Eof) => return Ok(None),
                Err(FfmpegError::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    return Ok(None);
                }
                Err(error) => return Err(SnapcacheError::Decode(error.to_string())),
            }
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn is_hardware_accelerated(&self) -> bool {
        self.hardware
    }
}

/// Cached swscale context together with the conversion it was built for.
struct Scaler {
    context: ScalingContext,
    source: (Pixel, u32, u32),
    output: ResolvedOutput,
}

// SAFETY: an SwsContext has no thread affinity. The converter owning it is
// driven by one thread at a time.
unsafe impl Send for Scaler {}

/// Scales and converts frames with swscale.
#[derive(Default)]
pub struct FfmpegConverter {
    scaler: Option<Scaler>,
}

impl FfmpegConverter {
    fn scaler(
        &mut self,
        frame: &VideoFrame,
        output: &ResolvedOutput,
    ) -> Result<&mut ScalingContext, SnapcacheError> {
        let source = (frame.format(), frame.width(), frame.height());
        let reusable = self
            .scaler
            .as_ref()
            .is_some_and(|scaler| scaler.source == source && scaler.output == *output);
        if !reusable {
            let context = ScalingContext::get(
                source.0,
                source.1,
                source.2,
                output.pixel_format.to_ffmpeg_pixel(),
                output.width,
                output.height,
                output.interpolation.to_scaling_flags(),
            )
            .map_err(|error| SnapcacheError::Convert(error.to_string()))?;
            self.scaler = Some(Scaler {
                context,
                source,
                output: *output,
            });
        }
        match self.scaler.as_mut() {
            Some(scaler) => Ok(&mut scaler.context),
            None => Err(SnapcacheError::Convert("scaler unavailable".to_string())),
        }
    }
}

impl FrameConverter<VideoFrame> for FfmpegConverter {
    fn convert(
        &mut self,
        frame: &VideoFrame,
        output: &ResolvedOutput,
    ) -> Result<DynamicImage, SnapcacheError> {
        let scaler = self.scaler(frame, output)?;
        let mut scaled = VideoFrame::empty();
        scaler
            .run(frame, &mut scaled)
            .map_err(|error| SnapcacheError::Convert(error.to_string()))?;

        let buffer = frame_to_buffer(
            &scaled,
            output.width,
            output.height,
            output.pixel_format.bytes_per_pixel(),
        );
        buffer_to_image(buffer, output.width, output.height, output.pixel_format).ok_or_else(|| {
            SnapcacheError::Convert("Failed to construct image from scaled frame data".to_string())
        })
    }
}
