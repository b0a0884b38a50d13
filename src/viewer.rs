//! Viewers: independent positions on the shared timeline.
//!
//! A [`Viewer`] is a lightweight handle. Its state (current position, window
//! and requested task ranges) lives in the engine's [`ViewerRegistry`], which
//! the demux thread polls for range changes before every scheduling pass.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::MediaBackend;
use crate::engine::{EngineShared, Session};
use crate::error::SnapcacheError;
use crate::snapshot::SnapshotImage;
use crate::task::TaskRange;
use crate::texture::TextureUploader;
use crate::window::SnapWindow;

/// Per-viewer state.
#[derive(Debug, Default)]
struct ViewerState {
    position: f64,
    window: Option<SnapWindow>,
    pending_ranges: Vec<TaskRange>,
    ranges_changed: bool,
}

impl ViewerState {
    /// Move to `pos`. Ranges are rebuilt when the window indices change or
    /// `force` is set. Returns whether the ranges were rebuilt.
    fn seek(&mut self, pos: f64, session: &Session, force: bool) -> bool {
        let window = session.geometry.compute_window(pos, &session.seek_index);
        let rebuild = force || self.window.is_none_or(|current| !current.same_indices(&window));
        self.position = pos;
        self.window = Some(window);
        if rebuild {
            self.pending_ranges = session
                .seek_index
                .ranges_from_index_span(window.cache_index0, window.cache_index1, &session.geometry)
                .into_iter()
                .map(|range| range.with_view(window.view_index0, window.view_index1))
                .collect();
            self.ranges_changed = true;
        }
        rebuild
    }
}

/// Outcome of a registry seek.
pub(crate) struct Seeked {
    /// Whether the ranges were rebuilt.
    pub(crate) rebuilt: bool,
    pub(crate) window: SnapWindow,
    /// Session the window was computed against.
    pub(crate) session: Arc<Session>,
}

#[derive(Debug, Default)]
struct Viewers {
    /// Geometry every stored window is computed against.
    session: Option<Arc<Session>>,
    states: BTreeMap<u64, ViewerState>,
}

/// Every viewer of an engine, keyed by viewer id.
///
/// The registry holds its own copy of the current session and only swaps it
/// in [`reseed`](ViewerRegistry::reseed), under the same lock as the viewer
/// states. A seek racing a reconfiguration therefore computes its window
/// either before the reseed (and is recomputed by it) or after it.
#[derive(Debug)]
pub(crate) struct ViewerRegistry {
    viewers: Mutex<Viewers>,
    changed: AtomicBool,
    next_id: AtomicU64,
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self {
            viewers: Mutex::new(Viewers::default()),
            changed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }
}

impl ViewerRegistry {
    /// Register a viewer positioned at `pos`. `None` while no session is
    /// installed.
    pub(crate) fn insert(&self, pos: f64) -> Option<u64> {
        let mut viewers = self.viewers.lock();
        let session = viewers.session.clone()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = ViewerState::default();
        state.seek(pos, &session, true);
        viewers.states.insert(id, state);
        self.changed.store(true, Ordering::Release);
        Some(id)
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let removed = self.viewers.lock().states.remove(&id).is_some();
        if removed {
            self.changed.store(true, Ordering::Release);
        }
        removed
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.viewers.lock().states.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.viewers.lock().states.len()
    }

    /// Seek viewer `id` against the installed session. `None` when the
    /// viewer is not registered or no session is installed.
    pub(crate) fn seek(&self, id: u64, pos: f64) -> Option<Seeked> {
        let mut viewers = self.viewers.lock();
        let Viewers { session, states } = &mut *viewers;
        let session = session.clone()?;
        let state = states.get_mut(&id)?;
        let rebuilt = state.seek(pos, &session, false);
        let window = state.window?;
        if rebuilt {
            self.changed.store(true, Ordering::Release);
        }
        Some(Seeked {
            rebuilt,
            window,
            session,
        })
    }

    pub(crate) fn window(&self, id: u64) -> Option<SnapWindow> {
        self.viewers.lock().states.get(&id).and_then(|state| state.window)
    }

    pub(crate) fn position(&self, id: u64) -> Option<f64> {
        self.viewers.lock().states.get(&id).map(|state| state.position)
    }

    /// Ranges of every viewer, if any viewer changed since the last call.
    pub(crate) fn collect_changed_ranges(&self) -> Option<Vec<TaskRange>> {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut viewers = self.viewers.lock();
        let mut ranges = Vec::new();
        let mut moved = 0;
        for state in viewers.states.values_mut() {
            if std::mem::take(&mut state.ranges_changed) {
                moved += 1;
            }
            ranges.extend(state.pending_ranges.iter().cloned());
        }
        log::trace!(
            "Collected {} range(s) from {} viewer(s), {moved} moved",
            ranges.len(),
            viewers.states.len()
        );
        Some(ranges)
    }

    /// Install `session` and recompute every viewer's window and ranges
    /// against it, even where the indices did not move.
    pub(crate) fn reseed(&self, session: Arc<Session>) {
        let mut viewers = self.viewers.lock();
        for state in viewers.states.values_mut() {
            let position = state.position;
            state.seek(position, &session, true);
        }
        viewers.session = Some(session);
        self.changed.store(true, Ordering::Release);
    }

    /// Drop every viewer and the installed session.
    pub(crate) fn clear(&self) {
        let mut viewers = self.viewers.lock();
        viewers.states.clear();
        viewers.session = None;
        self.changed.store(true, Ordering::Release);
    }
}

/// A position on the timeline of an [`Engine`](crate::Engine)'s source.
///
/// Viewers do not keep the engine alive. Once the engine is closed,
/// reopened or dropped, every call on an outstanding viewer fails with
/// [`SnapcacheError::EngineClosed`] or [`SnapcacheError::ViewerReleased`].
/// Dropping a viewer releases it.
pub struct Viewer<B: MediaBackend> {
    shared: Weak<EngineShared<B::Packet, B::Frame>>,
    id: u64,
    session_id: u64,
}

impl<B: MediaBackend> Debug for Viewer<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Viewer")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl<B: MediaBackend> Viewer<B> {
    pub(crate) fn new(shared: Weak<EngineShared<B::Packet, B::Frame>>, id: u64, session_id: u64) -> Self {
        Self {
            shared,
            id,
            session_id,
        }
    }

    /// Viewer id, unique within its engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn attach(&self) -> Result<(Arc<EngineShared<B::Packet, B::Frame>>, Arc<Session>), SnapcacheError> {
        let shared = self.shared.upgrade().ok_or(SnapcacheError::EngineClosed)?;
        let session = shared.session().ok_or(SnapcacheError::EngineClosed)?;
        if session.id != self.session_id || !shared.viewers.contains(self.id) {
            return Err(SnapcacheError::ViewerReleased);
        }
        Ok((shared, session))
    }

    /// Move the viewer to `pos` seconds.
    ///
    /// Returns `true` when the move changed the viewer's index windows and
    /// new task ranges were requested; moving within the same indices is
    /// cheap and returns `false`.
    pub fn seek(&self, pos: f64) -> Result<bool, SnapcacheError> {
        let (shared, _session) = self.attach()?;
        shared
            .viewers
            .seek(self.id, pos)
            .map(|seeked| seeked.rebuilt)
            .ok_or(SnapcacheError::ViewerReleased)
    }

    /// Seek to `pos` and return one snapshot per view index.
    ///
    /// Indices that are not decoded yet come back as placeholders carrying
    /// the ideal timestamp of their index. Calling this repeatedly at the
    /// same position is how a caller polls for progress.
    pub fn snapshots(&self, pos: f64) -> Result<Vec<SnapshotImage>, SnapcacheError> {
        let (shared, _session) = self.attach()?;
        let Seeked {
            window, session, ..
        } = shared
            .viewers
            .seek(self.id, pos)
            .ok_or(SnapcacheError::ViewerReleased)?;

        let list = shared.scheduler.current();
        let images = (window.view_index0..=window.view_index1)
            .map(|index| {
                list.find_owner(index)
                    .and_then(|task| task.snapshot_cell(index))
                    .filter(|cell| cell.is_ready())
                    .map(SnapshotImage::from_cell)
                    .unwrap_or_else(|| {
                        SnapshotImage::placeholder(index, session.geometry.index_to_millis(index))
                    })
            })
            .collect();
        Ok(images)
    }

    /// Create textures for every ready snapshot in `images` that has none,
    /// then free any textures the pipeline evicted meanwhile.
    ///
    /// Must be called on the thread that owns `uploader`'s graphics context.
    /// Returns the number of textures created.
    pub fn update_snapshot_texture(
        &self,
        images: &[SnapshotImage],
        uploader: &mut dyn TextureUploader,
    ) -> Result<usize, SnapcacheError> {
        let (shared, _session) = self.attach()?;
        let created = images
            .iter()
            .filter_map(SnapshotImage::cell)
            .filter(|cell| cell.materialize(uploader))
            .count();
        shared.deferred.drain(uploader);
        Ok(created)
    }

    /// The viewer's current windows.
    pub fn window(&self) -> Result<SnapWindow, SnapcacheError> {
        let (shared, _session) = self.attach()?;
        shared
            .viewers
            .window(self.id)
            .ok_or(SnapcacheError::ViewerReleased)
    }

    /// The last position passed to [`seek`](Viewer::seek), in seconds.
    pub fn position(&self) -> Result<f64, SnapcacheError> {
        let (shared, _session) = self.attach()?;
        shared
            .viewers
            .position(self.id)
            .ok_or(SnapcacheError::ViewerReleased)
    }

    /// Release the viewer. Its task ranges stop being requested; tasks no
    /// other viewer needs are retired. Returns `false` when the viewer was
    /// already gone.
    pub fn release(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        let Some(shared) = std::mem::take(&mut self.shared).upgrade() else {
            return false;
        };
        let same_session = shared
            .session()
            .is_some_and(|session| session.id == self.session_id);
        same_session && shared.viewers.remove(self.id)
    }
}

impl<B: MediaBackend> Drop for Viewer<B> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceInfo;
    use crate::configuration::EngineOptions;
    use crate::conversion::TimeBase;

    /// One minute at 25 fps with one-second GOPs, in milliseconds.
    fn session(window_ms: f64, frame_count: f64) -> Arc<Session> {
        let info = SourceInfo {
            url: "memory://minute".to_string(),
            video_stream_index: 0,
            duration_ms: 60_000.0,
            frame_interval_ms: 40.0,
            frame_count: 1_500,
            width: 64,
            height: 36,
            time_base: TimeBase::MILLISECONDS,
            start_pts: 0,
            keyframes: (0..60).map(|second| second * 1_000).collect(),
            codec: "synthetic".to_string(),
            hardware_accelerated: false,
        };
        Arc::new(Session::new(1, info, window_ms, frame_count, &EngineOptions::default()))
    }

    #[test]
    fn seek_after_reseed_uses_the_new_geometry() {
        let old = session(10_000.0, 25.0);
        let new = session(20_000.0, 10.0);
        let registry = ViewerRegistry::default();
        registry.reseed(old);
        let id = registry.insert(20.0).unwrap();

        registry.reseed(new.clone());
        assert_eq!(
            registry.window(id),
            Some(new.geometry.compute_window(20.0, &new.seek_index))
        );

        let seeked = registry.seek(id, 20.5).unwrap();
        let expected = new.geometry.compute_window(20.5, &new.seek_index);
        assert_eq!(seeked.window, expected);
        assert_eq!(registry.window(id), Some(expected));
        assert!(Arc::ptr_eq(&seeked.session, &new));

        let ranges = registry.collect_changed_ranges().unwrap();
        assert!(!ranges.is_empty());
        for range in ranges {
            assert!(range.index_range.end <= new.geometry.max_index() + 1, "{range:?}");
        }
    }

    #[test]
    fn repeated_seek_to_the_same_indices_changes_nothing() {
        let registry = ViewerRegistry::default();
        registry.reseed(session(10_000.0, 25.0));
        let id = registry.insert(5.0).unwrap();
        assert!(registry.collect_changed_ranges().is_some());

        assert!(!registry.seek(id, 5.0).unwrap().rebuilt);
        assert!(registry.collect_changed_ranges().is_none());
        assert!(registry.seek(id, 30.0).unwrap().rebuilt);
        assert!(registry.collect_changed_ranges().is_some());
    }

    #[test]
    fn cleared_registry_rejects_viewers() {
        let registry = ViewerRegistry::default();
        assert!(registry.insert(0.0).is_none());

        registry.reseed(session(10_000.0, 25.0));
        let id = registry.insert(0.0).unwrap();
        registry.clear();
        assert!(registry.seek(id, 1.0).is_none());
        assert!(registry.insert(0.0).is_none());
        assert_eq!(registry.len(), 0);
    }
}
