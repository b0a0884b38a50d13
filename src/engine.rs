//! The snapshot engine.
//!
//! An [`Engine`] owns one opened source, the three pipeline workers, and the
//! viewer table. Configuration changes that affect geometry or output are
//! applied stop-the-world: the workers are joined, every task is flushed, the
//! derived constants are recomputed, every viewer is re-seeded, and the
//! workers restart with the same collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::{MediaBackend, OpenedMedia, SourceInfo};
use crate::configuration::{
    EngineOptions, InterpolationMode, PixelFormat, ResolvedOutput, SnapshotOutputOptions,
};
use crate::error::SnapcacheError;
use crate::pipeline::{Collaborators, Pipeline, PipelineContext, Tuning};
use crate::scheduler::Scheduler;
use crate::seek_index::SeekIndex;
use crate::texture::{DeferredTextures, TextureUploader};
use crate::viewer::{Viewer, ViewerRegistry};
use crate::window::SnapGeometry;

/// Everything derived from the opened source and the current settings.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) info: SourceInfo,
    pub(crate) seek_index: SeekIndex,
    pub(crate) geometry: SnapGeometry,
    pub(crate) output: ResolvedOutput,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        info: SourceInfo,
        window_size_ms: f64,
        window_frame_count: f64,
        options: &EngineOptions,
    ) -> Self {
        let geometry = SnapGeometry::new(&info, window_size_ms, window_frame_count, options.cache_factor);
        let seek_index = SeekIndex::new(
            info.keyframes.clone(),
            info.start_pts,
            geometry.half_frame_interval_pts(),
        );
        let output = options.output.resolve(info.width, info.height);
        Self {
            id,
            info,
            seek_index,
            geometry,
            output,
        }
    }
}

/// State shared between the engine, its viewers and its workers.
pub(crate) struct EngineShared<P, F> {
    session: RwLock<Option<Arc<Session>>>,
    pub(crate) viewers: Arc<ViewerRegistry>,
    pub(crate) scheduler: Arc<Scheduler<P, F>>,
    pub(crate) deferred: Arc<DeferredTextures>,
    pub(crate) pending_frames: Arc<AtomicUsize>,
}

impl<P, F> EngineShared<P, F> {
    fn new() -> Self {
        let pending_frames = Arc::new(AtomicUsize::new(0));
        let deferred = Arc::new(DeferredTextures::default());
        Self {
            session: RwLock::new(None),
            viewers: Arc::new(ViewerRegistry::default()),
            scheduler: Arc::new(Scheduler::new(pending_frames.clone(), deferred.clone())),
            deferred,
            pending_frames,
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    fn replace_session(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        std::mem::replace(&mut *self.session.write(), session)
    }
}

/// Point-in-time counters of an engine, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatistics {
    /// Registered viewers.
    pub viewers: usize,
    /// Live tasks in the published list.
    pub tasks: usize,
    /// Live tasks overlapping at least one view window.
    pub in_view_tasks: usize,
    /// Tasks the decoder has started on.
    pub decoding_tasks: usize,
    /// Tasks fully decoded.
    pub decoded_tasks: usize,
    /// Retired tasks waiting for the workers to move on.
    pub retired_tasks: usize,
    /// Compressed packets queued across all tasks.
    pub queued_packets: usize,
    /// Decoded frames not yet converted.
    pub pending_frames: usize,
    /// Snapshots with a converted image.
    pub ready_snapshots: usize,
    /// Evicted textures waiting for the graphics thread.
    pub deferred_textures: usize,
    /// Generation of the published task list.
    pub generation: u64,
}

/// A multi-viewer snapshot cache over one video source.
///
/// # Example
///
/// ```no_run
/// # #[cfg(feature = "ffmpeg")]
/// # fn main() -> Result<(), snapcache::SnapcacheError> {
/// use snapcache::{Engine, FfmpegBackend};
///
/// let mut engine = Engine::new(FfmpegBackend::new());
/// engine.open("input.mp4")?;
/// engine.config_snap_window(20.0, 10.0)?;
///
/// let viewer = engine.create_viewer(0.0)?;
/// for snapshot in viewer.snapshots(0.0)? {
///     println!("{} ready: {}", snapshot.index(), snapshot.is_ready());
/// }
/// # Ok(())
/// # }
/// # #[cfg(not(feature = "ffmpeg"))]
/// # fn main() {}
/// ```
pub struct Engine<B: MediaBackend> {
    backend: B,
    options: EngineOptions,
    shared: Arc<EngineShared<B::Packet, B::Frame>>,
    pipeline: Option<Pipeline<B::Packet, B::Frame>>,
    supported_formats: Vec<PixelFormat>,
    next_session_id: u64,
}

impl<B: MediaBackend> Engine<B> {
    /// Create an engine with default options.
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, EngineOptions::default())
    }

    /// Create an engine with custom options.
    pub fn with_options(backend: B, options: EngineOptions) -> Self {
        Self {
            backend,
            options,
            shared: Arc::new(EngineShared::new()),
            pipeline: None,
            supported_formats: PixelFormat::ALL.to_vec(),
            next_session_id: 1,
        }
    }

    /// The engine's current options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Open `url` through the backend and start the pipeline.
    ///
    /// Any previously opened source is closed first, invalidating its
    /// viewers.
    pub fn open(&mut self, url: &str) -> Result<(), SnapcacheError> {
        self.close();
        log::debug!("Opening {url}");
        let media = self.backend.open(url, &self.options.decoder)?;
        self.open_media(media)
    }

    /// Start the pipeline over already opened collaborators.
    pub fn open_media(
        &mut self,
        media: OpenedMedia<B::Packet, B::Frame>,
    ) -> Result<(), SnapcacheError> {
        self.close();
        let OpenedMedia {
            info,
            demuxer,
            decoder,
            converter,
        } = media;

        if !(info.duration_ms > 0.0 && info.frame_interval_ms > 0.0) {
            return Err(SnapcacheError::SourceOpen {
                url: info.url,
                reason: "source reports no duration or frame rate".to_string(),
            });
        }
        let frame_count = self.options.window_frame_count;
        if !(frame_count.is_finite() && frame_count >= 1.0) {
            return Err(SnapcacheError::InvalidFrameCount(frame_count));
        }
        let pixel_format = self.options.output.pixel_format;
        if !converter.supports(pixel_format) {
            return Err(SnapcacheError::UnsupportedColorFormat(pixel_format));
        }
        self.supported_formats = PixelFormat::ALL
            .into_iter()
            .filter(|&format| converter.supports(format))
            .collect();

        let window_size_ms = clamp_window_ms(
            self.options.window_size.as_secs_f64() * 1_000.0,
            frame_count,
            &info,
        );
        let id = self.next_session_id;
        self.next_session_id += 1;

        log::debug!(
            "Opened {}: {}x{} {}, {:.3} fps, {:.1} s, {} keyframe(s){}",
            info.url,
            info.width,
            info.height,
            info.codec,
            info.frames_per_second(),
            info.duration_seconds(),
            info.keyframes.len(),
            if decoder.is_hardware_accelerated() {
                ", hardware decoding"
            } else {
                ""
            }
        );

        let session = Arc::new(Session::new(id, info, window_size_ms, frame_count, &self.options));
        self.shared.replace_session(Some(session.clone()));
        self.shared.viewers.reseed(session);
        self.start(Collaborators {
            demuxer: Some(demuxer),
            decoder: Some(decoder),
            converter: Some(converter),
        })
    }

    /// Stop the pipeline and drop the source. Outstanding viewers become
    /// invalid. Textures of evicted snapshots stay queued for
    /// [`drain_deferred_textures`](Engine::drain_deferred_textures).
    pub fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            drop(pipeline.stop());
        }
        let closed = self.shared.replace_session(None);
        self.shared.viewers.clear();
        self.shared.scheduler.flush();
        if let Some(session) = closed {
            log::debug!("Closed {}", session.info.url);
        }
    }

    /// Whether a source is open.
    pub fn is_opened(&self) -> bool {
        self.shared.session().is_some()
    }

    /// Description of the opened source.
    pub fn source_info(&self) -> Option<SourceInfo> {
        self.shared.session().map(|session| session.info.clone())
    }

    /// Configure the window as `window_seconds` seconds showing
    /// `frame_count` snapshots.
    ///
    /// The window is clamped to
    /// [`min_window_size`](Engine::min_window_size)..=[`max_window_size`](Engine::max_window_size)
    /// and the applied size, in seconds, is returned. Re-applying the current
    /// configuration is a no-op.
    pub fn config_snap_window(
        &mut self,
        window_seconds: f64,
        frame_count: f64,
    ) -> Result<f64, SnapcacheError> {
        if !(frame_count.is_finite() && frame_count >= 1.0) {
            return Err(SnapcacheError::InvalidFrameCount(frame_count));
        }
        if !(window_seconds.is_finite() && window_seconds > 0.0) {
            return Err(SnapcacheError::InvalidWindowSize(window_seconds));
        }
        let session = self.shared.session().ok_or(SnapcacheError::EngineClosed)?;
        let window_size_ms = clamp_window_ms(window_seconds * 1_000.0, frame_count, &session.info);

        self.options.window_size = Duration::from_secs_f64(window_seconds);
        self.options.window_frame_count = frame_count;
        if window_size_ms == session.geometry.window_size_ms()
            && frame_count == session.geometry.window_frame_count()
        {
            return Ok(window_size_ms / 1_000.0);
        }

        log::debug!("Snap window: {window_size_ms:.1} ms, {frame_count} snapshot(s)");
        self.reconfigure(window_size_ms, frame_count)?;
        Ok(window_size_ms / 1_000.0)
    }

    /// Set the cache factor (at least 1).
    pub fn set_cache_factor(&mut self, factor: f64) -> Result<(), SnapcacheError> {
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(SnapcacheError::InvalidCacheFactor(factor));
        }
        if factor == self.options.cache_factor {
            return Ok(());
        }
        self.options.cache_factor = factor;
        self.reconfigure_current()
    }

    /// Produce snapshots of exactly `width`x`height` pixels.
    pub fn set_snapshot_size(&mut self, width: u32, height: u32) -> Result<(), SnapcacheError> {
        if width == 0 || height == 0 {
            return Err(SnapcacheError::InvalidSnapshotSize { width, height });
        }
        let output = self
            .options
            .output
            .clone()
            .with_resolution(Some(width), Some(height));
        self.apply_output(output)
    }

    /// Produce snapshots scaled from the source size by the given factors.
    /// Clears any explicit size.
    pub fn set_snapshot_resize_factor(
        &mut self,
        width_factor: f64,
        height_factor: f64,
    ) -> Result<(), SnapcacheError> {
        let valid = |factor: f64| factor.is_finite() && factor > 0.0;
        if !valid(width_factor) || !valid(height_factor) {
            return Err(SnapcacheError::InvalidResizeFactor {
                width_factor,
                height_factor,
            });
        }
        let output = self
            .options
            .output
            .clone()
            .with_resolution(None, None)
            .with_resize_factor(width_factor, height_factor);
        self.apply_output(output)
    }

    /// Set the snapshot pixel format.
    pub fn set_color_format(&mut self, format: PixelFormat) -> Result<(), SnapcacheError> {
        if self.is_opened() && !self.supported_formats.contains(&format) {
            return Err(SnapcacheError::UnsupportedColorFormat(format));
        }
        let output = self.options.output.clone().with_pixel_format(format);
        self.apply_output(output)
    }

    /// Set the resampling filter used when scaling frames.
    pub fn set_interpolation_mode(&mut self, mode: InterpolationMode) -> Result<(), SnapcacheError> {
        let output = self.options.output.clone().with_interpolation(mode);
        self.apply_output(output)
    }

    /// Smallest window size, in seconds: one frame interval per snapshot.
    pub fn min_window_size(&self) -> Option<f64> {
        self.shared.session().map(|session| {
            session.info.frame_interval_ms * session.geometry.window_frame_count() / 1_000.0
        })
    }

    /// Largest window size, in seconds: the source duration.
    pub fn max_window_size(&self) -> Option<f64> {
        self.shared
            .session()
            .map(|session| session.info.duration_seconds())
    }

    /// Applied window size, in seconds.
    pub fn window_size(&self) -> Option<f64> {
        self.shared
            .session()
            .map(|session| session.geometry.window_size_ms() / 1_000.0)
    }

    /// Configured number of snapshots per window.
    pub fn window_frame_count(&self) -> Option<f64> {
        self.shared
            .session()
            .map(|session| session.geometry.window_frame_count())
    }

    /// Time between two snapshot indices.
    pub fn snapshot_interval(&self) -> Option<Duration> {
        self.shared
            .session()
            .map(|session| Duration::from_secs_f64(session.geometry.snapshot_interval_ms() / 1_000.0))
    }

    /// Create a viewer positioned at `pos` seconds.
    pub fn create_viewer(&self, pos: f64) -> Result<Viewer<B>, SnapcacheError> {
        let session = self.shared.session().ok_or(SnapcacheError::EngineClosed)?;
        let id = self
            .shared
            .viewers
            .insert(pos)
            .ok_or(SnapcacheError::EngineClosed)?;
        log::debug!("Viewer {id} created at {pos:.3} s");
        Ok(Viewer::new(Arc::downgrade(&self.shared), id, session.id))
    }

    /// Release `viewer`. Equivalent to [`Viewer::release`].
    pub fn release_viewer(&self, viewer: Viewer<B>) -> bool {
        viewer.release()
    }

    /// Free every evicted texture through `uploader`. Returns how many were
    /// freed. Call on the graphics thread.
    pub fn drain_deferred_textures(&self, uploader: &mut dyn TextureUploader) -> usize {
        self.shared.deferred.drain(uploader)
    }

    /// Current pipeline counters.
    pub fn statistics(&self) -> EngineStatistics {
        let list = self.shared.scheduler.current();
        let mut statistics = EngineStatistics {
            viewers: self.shared.viewers.len(),
            tasks: list.tasks().len(),
            retired_tasks: self.shared.scheduler.retired_count(),
            pending_frames: self.shared.pending_frames.load(Ordering::Acquire),
            deferred_textures: self.shared.deferred.len(),
            generation: list.generation(),
            ..EngineStatistics::default()
        };
        for task in list.tasks() {
            statistics.in_view_tasks += usize::from(task.in_view());
            statistics.decoding_tasks += usize::from(task.is_decoding());
            statistics.decoded_tasks += usize::from(task.is_decoder_eof());
            statistics.queued_packets += task.queued_packets();
            statistics.ready_snapshots += task.ready_count();
        }
        statistics
    }

    fn apply_output(&mut self, output: SnapshotOutputOptions) -> Result<(), SnapcacheError> {
        if output == self.options.output {
            return Ok(());
        }
        let unchanged = self.shared.session().is_some_and(|session| {
            output.resolve(session.info.width, session.info.height) == session.output
        });
        self.options.output = output;
        if unchanged {
            return Ok(());
        }
        self.reconfigure_current()
    }

    fn reconfigure_current(&mut self) -> Result<(), SnapcacheError> {
        match self.shared.session() {
            Some(session) => self.reconfigure(
                session.geometry.window_size_ms(),
                session.geometry.window_frame_count(),
            ),
            None => Ok(()),
        }
    }

    /// Stop the workers, flush all work, rebuild the session and restart.
    fn reconfigure(&mut self, window_size_ms: f64, frame_count: f64) -> Result<(), SnapcacheError> {
        let Some(session) = self.shared.session() else {
            return Ok(());
        };
        let mut collaborators = match self.pipeline.take() {
            Some(pipeline) => pipeline.stop(),
            None => Collaborators {
                demuxer: None,
                decoder: None,
                converter: None,
            },
        };
        self.shared.scheduler.flush();
        if let Some(decoder) = collaborators.decoder.as_mut() {
            decoder.flush();
        }

        let session = Arc::new(Session::new(
            session.id,
            session.info.clone(),
            window_size_ms,
            frame_count,
            &self.options,
        ));
        self.shared.replace_session(Some(session.clone()));
        self.shared.viewers.reseed(session.clone());
        log::debug!(
            "Reconfigured: snapshot interval {:.1} ms, max index {}, output {}x{} {:?}",
            session.geometry.snapshot_interval_ms(),
            session.geometry.max_index(),
            session.output.width,
            session.output.height,
            session.output.pixel_format
        );
        self.start(collaborators)
    }

    fn start(
        &mut self,
        collaborators: Collaborators<B::Packet, B::Frame>,
    ) -> Result<(), SnapcacheError> {
        let session = self.shared.session().ok_or(SnapcacheError::EngineClosed)?;
        let context = PipelineContext::new(
            self.shared.scheduler.clone(),
            self.shared.viewers.clone(),
            self.shared.pending_frames.clone(),
            session.geometry.clone(),
            session.output,
            session.info.video_stream_index,
            Tuning::from(&self.options),
        );
        self.pipeline = Some(Pipeline::start(context, collaborators)?);
        Ok(())
    }
}

impl<B: MediaBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clamp a requested window to one frame interval per snapshot at least and
/// the source duration at most.
fn clamp_window_ms(requested_ms: f64, frame_count: f64, info: &SourceInfo) -> f64 {
    let min = info.frame_interval_ms * frame_count;
    let max = info.duration_ms.max(min);
    requested_ms.clamp(min, max)
}
