//! Synthetic media backend shared by the integration tests.
//!
//! Produces a constant-frame-rate stream of tiny frames whose pixels encode
//! their frame number, with configurable GOP size, B-frame-like reordering,
//! interleaved non-video packets and fault injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use image::DynamicImage;
use snapcache::{
    DecodedFrame, DecoderOptions, DemuxedPacket, Demuxer, Engine, EngineOptions, FrameConverter,
    MediaBackend, OpenedMedia, PixelFormat, ResolvedOutput, SnapcacheError, SourceInfo,
    TextureHandle, TextureUploader, TimeBase, VideoDecoder, buffer_to_image,
};

pub const VIDEO_STREAM: usize = 0;
pub const AUDIO_STREAM: usize = 1;

/// Shape of the synthetic source.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub frame_interval_ticks: i64,
    pub time_base: TimeBase,
    pub frame_count: u64,
    pub gop_size: u64,
    pub start_pts: i64,
    /// Explicit keyframe frame numbers, overriding `gop_size`.
    pub keyframe_frames: Option<Vec<u64>>,
    /// Emit frames in a B-frame-like decode order and reorder them in the
    /// decoder.
    pub reorder: bool,
    /// Insert one audio packet after every N video packets.
    pub audio_every: Option<u64>,
    pub width: u32,
    pub height: u32,
    /// Fail `read_packet` after this many successful reads.
    pub fail_demux_after: Option<usize>,
    /// Fail every conversion.
    pub fail_convert: bool,
    pub supported_formats: Vec<PixelFormat>,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            frame_interval_ticks: 40,
            time_base: TimeBase::MILLISECONDS,
            frame_count: 1_500,
            gop_size: 25,
            start_pts: 0,
            keyframe_frames: None,
            reorder: false,
            audio_every: None,
            width: 64,
            height: 36,
            fail_demux_after: None,
            fail_convert: false,
            supported_formats: PixelFormat::ALL.to_vec(),
        }
    }
}

impl SyntheticSource {
    pub fn with_gop_size(mut self, gop_size: u64) -> Self {
        self.gop_size = gop_size.max(1);
        self
    }

    pub fn with_frame_count(mut self, frame_count: u64) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_keyframes(mut self, frames: Vec<u64>) -> Self {
        self.keyframe_frames = Some(frames);
        self
    }

    pub fn with_reorder(mut self) -> Self {
        self.reorder = true;
        self
    }

    pub fn with_audio_every(mut self, every: u64) -> Self {
        self.audio_every = Some(every.max(1));
        self
    }

    pub fn with_time_base(mut self, time_base: TimeBase, frame_interval_ticks: i64) -> Self {
        self.time_base = time_base;
        self.frame_interval_ticks = frame_interval_ticks;
        self
    }

    pub fn with_start_pts(mut self, start_pts: i64) -> Self {
        self.start_pts = start_pts;
        self
    }

    pub fn failing_demux_after(mut self, reads: usize) -> Self {
        self.fail_demux_after = Some(reads);
        self
    }

    pub fn failing_convert(mut self) -> Self {
        self.fail_convert = true;
        self
    }

    pub fn supporting(mut self, formats: Vec<PixelFormat>) -> Self {
        self.supported_formats = formats;
        self
    }

    pub fn frame_interval_ms(&self) -> f64 {
        self.time_base.pts_to_millis(self.frame_interval_ticks)
    }

    pub fn duration_ms(&self) -> f64 {
        self.frame_count as f64 * self.frame_interval_ms()
    }

    pub fn pts_of(&self, frame: u64) -> i64 {
        self.start_pts + frame as i64 * self.frame_interval_ticks
    }

    fn keyframe_set(&self) -> BTreeSet<u64> {
        match &self.keyframe_frames {
            Some(frames) => frames
                .iter()
                .copied()
                .filter(|&frame| frame < self.frame_count)
                .collect(),
            None => (0..self.frame_count).step_by(self.gop_size as usize).collect(),
        }
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            url: "synthetic://clip".to_string(),
            video_stream_index: VIDEO_STREAM,
            duration_ms: self.duration_ms(),
            frame_interval_ms: self.frame_interval_ms(),
            frame_count: self.frame_count,
            width: self.width,
            height: self.height,
            time_base: self.time_base,
            start_pts: self.start_pts,
            keyframes: self
                .keyframe_set()
                .into_iter()
                .map(|frame| self.pts_of(frame))
                .collect(),
            codec: "synthetic".to_string(),
            hardware_accelerated: false,
        }
    }

    /// Packets in decode order.
    fn packets(&self) -> Vec<SyntheticPacket> {
        let keyframes = self.keyframe_set();
        let mut order: Vec<u64> = (0..self.frame_count).collect();
        if self.reorder {
            // Swap each pair of frames after a keyframe, like an IPB pattern.
            let mut index = 0;
            while index + 2 < order.len() {
                let (first, second) = (order[index + 1], order[index + 2]);
                if !keyframes.contains(&first) && !keyframes.contains(&second) {
                    order.swap(index + 1, index + 2);
                    index += 3;
                } else {
                    index += 1;
                }
            }
        }

        let mut packets = Vec::new();
        for (position, frame) in order.into_iter().enumerate() {
            packets.push(SyntheticPacket {
                stream_index: VIDEO_STREAM,
                frame,
                pts: self.pts_of(frame),
                is_key: keyframes.contains(&frame),
            });
            if let Some(every) = self.audio_every {
                if (position as u64 + 1) % every == 0 {
                    packets.push(SyntheticPacket {
                        stream_index: AUDIO_STREAM,
                        frame,
                        pts: self.pts_of(frame),
                        is_key: true,
                    });
                }
            }
        }
        packets
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyntheticPacket {
    pub stream_index: usize,
    pub frame: u64,
    pub pts: i64,
    pub is_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub frame: u64,
    pub pts: i64,
}

/// Counters the tests inspect.
#[derive(Debug, Default)]
pub struct Probe {
    pub opens: AtomicUsize,
    pub seeks: AtomicUsize,
    pub packets_read: AtomicUsize,
    pub frames_decoded: AtomicUsize,
    pub flushes: AtomicUsize,
    pub conversions: AtomicUsize,
}

impl Probe {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    pub source: SyntheticSource,
    pub probe: Arc<Probe>,
}

impl SyntheticBackend {
    pub fn new(source: SyntheticSource) -> Self {
        Self {
            source,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn media(&self) -> OpenedMedia<SyntheticPacket, SyntheticFrame> {
        OpenedMedia {
            info: self.source.info(),
            demuxer: Box::new(SyntheticDemuxer {
                packets: self.source.packets(),
                position: 0,
                reads: 0,
                fail_after: self.source.fail_demux_after,
                probe: self.probe.clone(),
            }),
            decoder: Box::new(SyntheticDecoder {
                reorder_delay: usize::from(self.source.reorder),
                buffered: BTreeMap::new(),
                draining: false,
                probe: self.probe.clone(),
            }),
            converter: Box::new(SyntheticConverter {
                fail: self.source.fail_convert,
                supported: self.source.supported_formats.clone(),
                probe: self.probe.clone(),
            }),
        }
    }
}

impl MediaBackend for SyntheticBackend {
    type Packet = SyntheticPacket;
    type Frame = SyntheticFrame;

    fn open(
        &self,
        url: &str,
        _options: &DecoderOptions,
    ) -> Result<OpenedMedia<SyntheticPacket, SyntheticFrame>, SnapcacheError> {
        if url.contains("missing") {
            return Err(SnapcacheError::SourceOpen {
                url: url.to_string(),
                reason: "no such source".to_string(),
            });
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        let mut media = self.media();
        media.info.url = url.to_string();
        Ok(media)
    }
}

pub struct SyntheticDemuxer {
    packets: Vec<SyntheticPacket>,
    position: usize,
    reads: usize,
    fail_after: Option<usize>,
    probe: Arc<Probe>,
}

impl Demuxer<SyntheticPacket> for SyntheticDemuxer {
    fn seek(&mut self, pts: i64) -> Result<(), SnapcacheError> {
        self.probe.seeks.fetch_add(1, Ordering::SeqCst);
        self.position = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, packet)| {
                packet.stream_index == VIDEO_STREAM && packet.is_key && packet.pts <= pts
            })
            .map(|(position, _)| position)
            .last()
            .unwrap_or(0);
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<DemuxedPacket<SyntheticPacket>>, SnapcacheError> {
        if self.fail_after.is_some_and(|limit| self.reads >= limit) {
            return Err(SnapcacheError::Demux("injected demux fault".to_string()));
        }
        let Some(packet) = self.packets.get(self.position).copied() else {
            return Ok(None);
        };
        self.position += 1;
        self.reads += 1;
        self.probe.packets_read.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DemuxedPacket {
            stream_index: packet.stream_index,
            pts: packet.pts,
            is_key: packet.is_key,
            payload: packet,
        }))
    }
}

/// Buffers frames and releases them in pts order, `reorder_delay` frames
/// behind the input, like a decoder with B-frames.
pub struct SyntheticDecoder {
    reorder_delay: usize,
    buffered: BTreeMap<i64, SyntheticFrame>,
    draining: bool,
    probe: Arc<Probe>,
}

impl VideoDecoder<SyntheticPacket, SyntheticFrame> for SyntheticDecoder {
    fn send_packet(&mut self, packet: DemuxedPacket<SyntheticPacket>) -> Result<(), SnapcacheError> {
        if packet.stream_index != VIDEO_STREAM {
            return Err(SnapcacheError::Decode("non-video packet sent to decoder".to_string()));
        }
        self.buffered.insert(
            packet.pts,
            SyntheticFrame {
                frame: packet.payload.frame,
                pts: packet.pts,
            },
        );
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), SnapcacheError> {
        self.draining = true;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame<SyntheticFrame>>, SnapcacheError> {
        if !self.draining && self.buffered.len() <= self.reorder_delay {
            return Ok(None);
        }
        let Some((pts, frame)) = self.buffered.pop_first() else {
            return Ok(None);
        };
        self.probe.frames_decoded.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DecodedFrame { pts, payload: frame }))
    }

    fn flush(&mut self) {
        self.probe.flushes.fetch_add(1, Ordering::SeqCst);
        self.buffered.clear();
        self.draining = false;
    }
}

/// Produces a solid image whose first channel is the frame number modulo
/// 256 and whose second channel is the frame number divided by 256.
pub struct SyntheticConverter {
    fail: bool,
    supported: Vec<PixelFormat>,
    probe: Arc<Probe>,
}

pub fn frame_number_of(image: &DynamicImage) -> u64 {
    let rgba = image.to_rgba8();
    let pixel = rgba.get_pixel(0, 0);
    u64::from(pixel[0]) + 256 * u64::from(pixel[1])
}

impl FrameConverter<SyntheticFrame> for SyntheticConverter {
    fn convert(
        &mut self,
        frame: &SyntheticFrame,
        output: &ResolvedOutput,
    ) -> Result<DynamicImage, SnapcacheError> {
        if self.fail {
            return Err(SnapcacheError::Convert("injected convert fault".to_string()));
        }
        self.probe.conversions.fetch_add(1, Ordering::SeqCst);
        let low = (frame.frame % 256) as u8;
        let high = (frame.frame / 256) as u8;
        let pixel: &[u8] = match output.pixel_format {
            PixelFormat::Rgb8 => &[low, high, 0],
            PixelFormat::Rgba8 => &[low, high, 0, 255],
            PixelFormat::Gray8 => &[low],
        };
        let count = (output.width * output.height) as usize;
        let buffer = pixel.repeat(count);
        buffer_to_image(buffer, output.width, output.height, output.pixel_format)
            .ok_or_else(|| SnapcacheError::Convert("bad buffer".to_string()))
    }

    fn supports(&self, format: PixelFormat) -> bool {
        self.supported.contains(&format)
    }
}

/// Texture uploader that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingUploader {
    pub next_id: u64,
    pub live: HashMap<u64, (u32, u32)>,
    pub created: usize,
    pub destroyed: Vec<TextureHandle>,
    pub fail_uploads: bool,
}

impl TextureUploader for RecordingUploader {
    fn create_texture(&mut self, image: &DynamicImage) -> Option<TextureHandle> {
        if self.fail_uploads {
            return None;
        }
        self.next_id += 1;
        self.created += 1;
        self.live.insert(self.next_id, (image.width(), image.height()));
        Some(TextureHandle::new(self.next_id))
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.live.remove(&handle.raw());
        self.destroyed.push(handle);
    }
}

/// Options tuned for fast tests.
pub fn fast_options() -> EngineOptions {
    EngineOptions::new()
        .with_idle_sleep(Duration::from_millis(1))
        .with_cache_factor(2.0)
}

/// Engine over `source`, opened and configured with a `window_seconds`
/// window of `frame_count` snapshots.
pub fn open_engine(
    source: SyntheticSource,
    window_seconds: f64,
    frame_count: f64,
) -> (Engine<SyntheticBackend>, Arc<Probe>) {
    let backend = SyntheticBackend::new(source);
    let probe = backend.probe.clone();
    let options = fast_options().with_snap_window(Duration::from_secs_f64(window_seconds), frame_count);
    let mut engine = Engine::with_options(backend, options);
    engine.open("synthetic://clip").expect("Failed to open synthetic source");
    (engine, probe)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wait until every snapshot of `viewer`'s view at `pos` is ready and the
/// pipeline has no decode or convert work left, then return the snapshots.
pub fn settle<B: snapcache::MediaBackend>(
    engine: &Engine<B>,
    viewer: &snapcache::Viewer<B>,
    pos: f64,
) -> Vec<snapcache::SnapshotImage> {
    let settled = wait_until(TIMEOUT, || {
        let ready = viewer
            .snapshots(pos)
            .map(|snapshots| snapshots.iter().all(|snapshot| snapshot.is_ready()))
            .unwrap_or(false);
        let statistics = engine.statistics();
        ready
            && statistics.tasks > 0
            && statistics.decoded_tasks == statistics.tasks
            && statistics.pending_frames == 0
    });
    assert!(settled, "Snapshots did not settle: {:?}", engine.statistics());
    viewer.snapshots(pos).expect("Failed to read snapshots")
}
