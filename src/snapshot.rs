//! Snapshot images handed to viewers.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use image::DynamicImage;
use parking_lot::Mutex;

use crate::texture::{DeferredTextures, TextureHandle, TextureUploader};

/// Shared state of one accepted snapshot.
///
/// The owning task keeps one `Arc`; every [`SnapshotImage`] returned to a
/// viewer keeps another, so an image stays readable after its task is
/// evicted. The texture, however, is always owned by the task side: once the
/// cell is retired, its texture goes to the deferred-free queue and no new
/// texture is created for it.
#[derive(Debug)]
pub(crate) struct SnapshotCell {
    index: u32,
    timestamp_ms: f64,
    image: OnceLock<Arc<DynamicImage>>,
    texture: Mutex<TextureSlot>,
}

#[derive(Debug, Default)]
struct TextureSlot {
    handle: Option<TextureHandle>,
    retired: bool,
}

impl SnapshotCell {
    pub(crate) fn new(index: u32, timestamp_ms: f64) -> Self {
        Self {
            index,
            timestamp_ms,
            image: OnceLock::new(),
            texture: Mutex::new(TextureSlot::default()),
        }
    }

    pub(crate) fn set_image(&self, image: DynamicImage) {
        let _ = self.image.set(Arc::new(image));
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.image.get().is_some()
    }

    /// Create the texture if the image is ready and no texture exists yet.
    /// Returns `true` when a texture was created.
    pub(crate) fn materialize(&self, uploader: &mut dyn TextureUploader) -> bool {
        let Some(image) = self.image.get() else {
            return false;
        };
        let mut slot = self.texture.lock();
        if slot.retired || slot.handle.is_some() {
            return false;
        }
        slot.handle = uploader.create_texture(image);
        slot.handle.is_some()
    }

    /// Give up the texture. Later [`materialize`](SnapshotCell::materialize)
    /// calls are no-ops.
    pub(crate) fn retire(&self, deferred: &DeferredTextures) {
        let mut slot = self.texture.lock();
        slot.retired = true;
        if let Some(handle) = slot.handle.take() {
            deferred.push(handle);
        }
    }
}

/// One snapshot of a viewer's view range.
///
/// Either a decoded image (with an optional texture) or a placeholder that
/// carries only the ideal timestamp of its index. Placeholders are normal:
/// they mean the index has not been decoded yet.
#[derive(Debug, Clone)]
pub struct SnapshotImage {
    index: u32,
    timestamp_ms: f64,
    cell: Option<Arc<SnapshotCell>>,
}

impl SnapshotImage {
    pub(crate) fn placeholder(index: u32, timestamp_ms: f64) -> Self {
        Self {
            index,
            timestamp_ms,
            cell: None,
        }
    }

    pub(crate) fn from_cell(cell: Arc<SnapshotCell>) -> Self {
        Self {
            index: cell.index,
            timestamp_ms: cell.timestamp_ms,
            cell: Some(cell),
        }
    }

    pub(crate) fn cell(&self) -> Option<&Arc<SnapshotCell>> {
        self.cell.as_ref()
    }

    /// Snapshot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Timestamp in milliseconds from stream start: the decoded frame's
    /// timestamp when ready, the ideal index timestamp otherwise.
    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }

    /// Timestamp as a [`Duration`].
    pub fn timestamp(&self) -> Duration {
        Duration::from_secs_f64(self.timestamp_ms.max(0.0) / 1_000.0)
    }

    /// Whether this is a decoded image rather than a placeholder.
    pub fn is_ready(&self) -> bool {
        self.cell.as_ref().is_some_and(|cell| cell.is_ready())
    }

    /// The decoded image, if ready.
    pub fn image(&self) -> Option<Arc<DynamicImage>> {
        self.cell.as_ref().and_then(|cell| cell.image.get().cloned())
    }

    /// The texture created by
    /// [`Viewer::update_snapshot_texture`](crate::Viewer::update_snapshot_texture),
    /// if any and not yet evicted.
    pub fn texture(&self) -> Option<TextureHandle> {
        self.cell.as_ref().and_then(|cell| cell.texture.lock().handle)
    }

    /// Whether [`texture`](SnapshotImage::texture) is available.
    pub fn is_texture_ready(&self) -> bool {
        self.texture().is_some()
    }
}
