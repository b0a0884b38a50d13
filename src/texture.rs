//! Texture handles and the deferred-free queue.
//!
//! Textures are created and destroyed only on the caller's graphics thread,
//! through a caller-supplied [`TextureUploader`]. When the pipeline evicts a
//! snapshot that already owns a texture, it cannot destroy it itself: the
//! handle is pushed onto the engine's [`DeferredTextures`] queue and freed the
//! next time the caller runs
//! [`Viewer::update_snapshot_texture`](crate::Viewer::update_snapshot_texture)
//! or [`Engine::drain_deferred_textures`](crate::Engine::drain_deferred_textures).

use image::DynamicImage;
use parking_lot::Mutex;

/// Opaque handle to a texture owned by the caller's renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

impl TextureHandle {
    /// Wrap a renderer-specific texture id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The renderer-specific texture id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Creates and destroys textures on the graphics thread.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
///
/// use image::DynamicImage;
/// use snapcache::{TextureHandle, TextureUploader};
///
/// #[derive(Default)]
/// struct CpuTextures {
///     next_id: u64,
///     live: HashMap<u64, (u32, u32)>,
/// }
///
/// impl TextureUploader for CpuTextures {
///     fn create_texture(&mut self, image: &DynamicImage) -> Option<TextureHandle> {
///         self.next_id += 1;
///         self.live.insert(self.next_id, (image.width(), image.height()));
///         Some(TextureHandle::new(self.next_id))
///     }
///
///     fn destroy_texture(&mut self, handle: TextureHandle) {
///         self.live.remove(&handle.raw());
///     }
/// }
/// ```
pub trait TextureUploader {
    /// Upload `image`. `None` means the upload failed; it is retried on the
    /// next call.
    fn create_texture(&mut self, image: &DynamicImage) -> Option<TextureHandle>;

    /// Free a texture previously returned by
    /// [`create_texture`](TextureUploader::create_texture).
    fn destroy_texture(&mut self, handle: TextureHandle);
}

/// Handles whose snapshots were evicted, waiting for the graphics thread.
#[derive(Debug, Default)]
pub(crate) struct DeferredTextures {
    queue: Mutex<Vec<TextureHandle>>,
}

impl DeferredTextures {
    pub(crate) fn push(&self, handle: TextureHandle) {
        self.queue.lock().push(handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Destroy every queued texture. Returns how many were freed.
    pub(crate) fn drain(&self, uploader: &mut dyn TextureUploader) -> usize {
        let handles = std::mem::take(&mut *self.queue.lock());
        let count = handles.len();
        for handle in handles {
            uploader.destroy_texture(handle);
        }
        if count > 0 {
            log::trace!("Freed {count} deferred texture(s)");
        }
        count
    }
}
