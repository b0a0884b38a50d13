//! # snapcache
//!
//! A multi-viewer video snapshot cache for timeline thumbnail strips.
//!
//! `snapcache` keeps evenly spaced snapshots of a video source decoded and
//! ready while one or more viewers scroll along its timeline. Each viewer
//! shows a window of `frame_count` snapshots spanning `window_size` seconds
//! and keeps a padded cache window around it warm. Decoding runs on three
//! background threads (demux, decode, convert) and works one GOP
//! (keyframe-to-keyframe span) at a time, so viewers looking at the same part
//! of the timeline share the work.
//!
//! Callers never block on the pipeline: [`Viewer::snapshots`] returns
//! immediately, with placeholders for the indices still in flight.
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "ffmpeg")]
//! # fn main() -> Result<(), snapcache::SnapcacheError> {
//! use snapcache::{Engine, FfmpegBackend};
//!
//! let mut engine = Engine::new(FfmpegBackend::new());
//! engine.open("input.mp4")?;
//! let window = engine.config_snap_window(30.0, 12.0)?;
//! println!("Window: {window:.1} s");
//!
//! let viewer = engine.create_viewer(0.0)?;
//! loop {
//!     let snapshots = viewer.snapshots(0.0)?;
//!     if snapshots.iter().all(|snapshot| snapshot.is_ready()) {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(20));
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "ffmpeg"))]
//! # fn main() {}
//! ```
//!
//! ## Textures
//!
//! Snapshots carry decoded [`image::DynamicImage`] buffers. Renderers that
//! want GPU textures implement [`TextureUploader`] and call
//! [`Viewer::update_snapshot_texture`] from their graphics thread; textures
//! of evicted snapshots are queued and freed on that same thread.
//!
//! ## Custom backends
//!
//! The engine only talks to a [`MediaBackend`] and the [`Demuxer`],
//! [`VideoDecoder`] and [`FrameConverter`] it returns. The FFmpeg backend is
//! one implementation; tests drive the engine with a synthetic one.
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ffmpeg` | [`FfmpegBackend`](crate::ffmpeg::FfmpegBackend), powered by `ffmpeg-next` |
//! | `hardware` | Hardware-accelerated decoding (CUDA, VAAPI, DXVA2, D3D11VA, VideoToolbox, QSV) |
//! | `cli` | The `snapcache` command-line tool |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! The `ffmpeg` feature needs the FFmpeg development libraries installed on
//! the system.

pub mod backend;
pub mod configuration;
pub mod conversion;
pub mod engine;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "hardware")]
pub mod hardware_acceleration;
mod pipeline;
mod scheduler;
pub mod seek_index;
pub mod snapshot;
pub mod task;
pub mod texture;
pub mod viewer;
pub mod window;

pub use backend::{
    DecodedFrame, DemuxedPacket, Demuxer, FrameConverter, MediaBackend, OpenedMedia, SourceInfo,
    VideoDecoder,
};
pub use configuration::{
    DecoderOptions, EngineOptions, InterpolationMode, PixelFormat, ResolvedOutput,
    SnapshotOutputOptions,
};
pub use conversion::{TimeBase, buffer_to_image};
pub use engine::{Engine, EngineStatistics};
pub use error::SnapcacheError;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{
    FfmpegBackend, FfmpegConverter, FfmpegDecoder, FfmpegDemuxer, FfmpegLogLevel,
    get_ffmpeg_log_level, set_ffmpeg_log_level,
};
#[cfg(feature = "hardware")]
pub use hardware_acceleration::{HardwareDeviceType, available_hardware_devices};
pub use seek_index::{SeekBounds, SeekIndex};
pub use snapshot::SnapshotImage;
pub use task::TaskRange;
pub use texture::{TextureHandle, TextureUploader};
pub use viewer::Viewer;
pub use window::{SnapGeometry, SnapWindow};
