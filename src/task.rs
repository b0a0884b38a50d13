//! GOP decode tasks.
//!
//! A [`GopTask`] is the unit of work of the pipeline: one keyframe-to-keyframe
//! span, the compressed packets read for it, and the snapshots decoded from
//! it. The three worker threads advance it cooperatively through
//! `idle → demuxing → demuxed → decoding → decoder eof`; the scheduler
//! retires it when no viewer needs it anymore.
//!
//! Cancellation is cooperative. Retiring a task flips its status from
//! [`TaskStatus::Active`] to [`TaskStatus::Cancelling`]; each worker observes
//! the flag once per loop iteration and lets go of the task. Once every
//! worker has moved on, the scheduler releases the task's resources and the
//! status becomes [`TaskStatus::Dead`].

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::DemuxedPacket;
use crate::seek_index::SeekBounds;
use crate::snapshot::SnapshotCell;
use crate::texture::DeferredTextures;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    /// Requested by at least one viewer.
    Active,
    /// Retired; workers must let go of it.
    Cancelling,
    /// Resources released.
    Dead,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskStatus::Active,
            1 => TaskStatus::Cancelling,
            _ => TaskStatus::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskStatus::Active => 0,
            TaskStatus::Cancelling => 1,
            TaskStatus::Dead => 2,
        }
    }
}

/// The span of work one task covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRange {
    /// GOP seek bounds. Two ranges with equal bounds describe the same work.
    pub seek_bounds: SeekBounds,
    /// Snapshot indices this GOP is responsible for, `[first, second)`.
    pub index_range: Range<u32>,
    /// Whether any index of the range is in a viewer's view window.
    pub in_view: bool,
    /// Index distance to the nearest view window (0 when in view).
    pub distance_to_view: u32,
}

impl TaskRange {
    pub(crate) fn new(seek_bounds: SeekBounds, index_range: Range<u32>) -> Self {
        Self {
            seek_bounds,
            index_range,
            in_view: false,
            distance_to_view: 0,
        }
    }

    /// Annotate the range with its relation to the view window
    /// `view_index0..=view_index1`.
    #[must_use]
    pub fn with_view(mut self, view_index0: u32, view_index1: u32) -> Self {
        let Range { start, end } = self.index_range;
        if end <= view_index0 {
            self.in_view = false;
            self.distance_to_view = view_index0 - end.saturating_sub(1).min(view_index0);
        } else if start > view_index1 {
            self.in_view = false;
            self.distance_to_view = start - view_index1;
        } else {
            self.in_view = true;
            self.distance_to_view = 0;
        }
        self
    }

    /// Whether `index` belongs to this range.
    pub fn contains(&self, index: u32) -> bool {
        self.index_range.contains(&index)
    }
}

/// Outcome of offering a decoded frame to a task.
#[derive(Debug)]
pub(crate) enum Offer<F> {
    /// The frame is now the best candidate of its index.
    Accepted,
    /// An equal or better candidate exists, or the task is no longer active.
    Rejected(F),
}

struct Candidate {
    pts: i64,
    bias: i64,
}

struct Snapshot<F> {
    index: u32,
    raw: Option<F>,
    cell: Arc<SnapshotCell>,
}

struct TaskFrames<F> {
    candidates: BTreeMap<u32, Candidate>,
    /// Index-sorted, one entry per index.
    snapshots: Vec<Snapshot<F>>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Decode work for one GOP.
pub(crate) struct GopTask<P, F> {
    id: u64,
    seek_bounds: SeekBounds,
    index_range: Range<u32>,
    in_view: AtomicBool,
    distance_to_view: AtomicU32,
    status: AtomicU8,
    demuxing: AtomicBool,
    demuxer_eof: AtomicBool,
    decoding: AtomicBool,
    decoder_eof: AtomicBool,
    packets: Mutex<VecDeque<DemuxedPacket<P>>>,
    frames: Mutex<TaskFrames<F>>,
    unconverted: AtomicUsize,
    pending_frames: Arc<AtomicUsize>,
    deferred: Arc<DeferredTextures>,
}

impl<P, F> GopTask<P, F> {
    pub(crate) fn new(
        range: &TaskRange,
        pending_frames: Arc<AtomicUsize>,
        deferred: Arc<DeferredTextures>,
    ) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            seek_bounds: range.seek_bounds,
            index_range: range.index_range.clone(),
            in_view: AtomicBool::new(range.in_view),
            distance_to_view: AtomicU32::new(range.distance_to_view),
            status: AtomicU8::new(TaskStatus::Active.as_u8()),
            demuxing: AtomicBool::new(false),
            demuxer_eof: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            decoder_eof: AtomicBool::new(false),
            packets: Mutex::new(VecDeque::new()),
            frames: Mutex::new(TaskFrames {
                candidates: BTreeMap::new(),
                snapshots: Vec::new(),
            }),
            unconverted: AtomicUsize::new(0),
            pending_frames,
            deferred,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn seek_bounds(&self) -> SeekBounds {
        self.seek_bounds
    }

    pub(crate) fn index_range(&self) -> &Range<u32> {
        &self.index_range
    }

    pub(crate) fn owns_index(&self, index: u32) -> bool {
        self.index_range.contains(&index)
    }

    pub(crate) fn in_view(&self) -> bool {
        self.in_view.load(Ordering::Relaxed)
    }

    pub(crate) fn distance_to_view(&self) -> u32 {
        self.distance_to_view.load(Ordering::Relaxed)
    }

    pub(crate) fn set_view(&self, in_view: bool, distance_to_view: u32) {
        self.in_view.store(in_view, Ordering::Relaxed);
        self.distance_to_view.store(distance_to_view, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.status() == TaskStatus::Active
    }

    pub(crate) fn cancel(&self) {
        let _ = self.status.compare_exchange(
            TaskStatus::Active.as_u8(),
            TaskStatus::Cancelling.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn is_demuxing(&self) -> bool {
        self.demuxing.load(Ordering::Acquire)
    }

    pub(crate) fn mark_demuxing(&self) {
        self.demuxing.store(true, Ordering::Release);
    }

    pub(crate) fn is_demuxer_eof(&self) -> bool {
        self.demuxer_eof.load(Ordering::Acquire)
    }

    pub(crate) fn mark_demuxer_eof(&self) {
        self.demuxer_eof.store(true, Ordering::Release);
    }

    pub(crate) fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::Acquire)
    }

    pub(crate) fn mark_decoding(&self) {
        self.decoding.store(true, Ordering::Release);
    }

    pub(crate) fn is_decoder_eof(&self) -> bool {
        self.decoder_eof.load(Ordering::Acquire)
    }

    pub(crate) fn mark_decoder_eof(&self) {
        self.decoder_eof.store(true, Ordering::Release);
    }

    pub(crate) fn push_packet(&self, packet: DemuxedPacket<P>) {
        self.packets.lock().push_back(packet);
    }

    pub(crate) fn pop_packet(&self) -> Option<DemuxedPacket<P>> {
        self.packets.lock().pop_front()
    }

    pub(crate) fn queued_packets(&self) -> usize {
        self.packets.lock().len()
    }

    /// Whether the decoder has packets (or a pending end of stream) to
    /// consume from this task.
    pub(crate) fn has_decoder_work(&self) -> bool {
        self.is_demuxing()
            && !self.is_decoder_eof()
            && (self.is_demuxer_eof() || self.queued_packets() > 0)
    }

    pub(crate) fn has_unconverted(&self) -> bool {
        self.unconverted.load(Ordering::Acquire) > 0
    }

    /// Offer a decoded frame for `index`.
    ///
    /// The frame wins the index only when the slot is empty or its bias is
    /// strictly smaller than the current candidate's. A winning frame
    /// replaces any previous snapshot of the index.
    pub(crate) fn offer(&self, index: u32, pts: i64, bias: i64, timestamp_ms: f64, frame: F) -> Offer<F> {
        let mut frames = self.frames.lock();
        if !self.is_active() || !self.owns_index(index) {
            return Offer::Rejected(frame);
        }
        if let Some(existing) = frames.candidates.get(&index) {
            if existing.bias <= bias {
                return Offer::Rejected(frame);
            }
            log::trace!(
                "Task {} index {index}: pts {pts} (bias {bias}) replaces pts {} (bias {})",
                self.id,
                existing.pts,
                existing.bias
            );
        }
        frames.candidates.insert(index, Candidate { pts, bias });

        let snapshot = Snapshot {
            index,
            raw: Some(frame),
            cell: Arc::new(SnapshotCell::new(index, timestamp_ms)),
        };
        match frames.snapshots.binary_search_by_key(&index, |s| s.index) {
            Ok(position) => {
                let previous = std::mem::replace(&mut frames.snapshots[position], snapshot);
                self.discard(previous);
            }
            Err(position) => frames.snapshots.insert(position, snapshot),
        }
        self.unconverted.fetch_add(1, Ordering::AcqRel);
        self.pending_frames.fetch_add(1, Ordering::AcqRel);
        Offer::Accepted
    }

    /// Take every unconverted frame, in index order.
    ///
    /// The in-flight counter stays charged until the caller has converted
    /// (or dropped) each frame.
    pub(crate) fn take_unconverted(&self) -> Vec<(Arc<SnapshotCell>, F)> {
        let mut frames = self.frames.lock();
        let taken: Vec<_> = frames
            .snapshots
            .iter_mut()
            .filter_map(|snapshot| snapshot.raw.take().map(|raw| (snapshot.cell.clone(), raw)))
            .collect();
        self.unconverted.fetch_sub(taken.len(), Ordering::AcqRel);
        taken
    }

    /// The snapshot cell of `index`, if one has been accepted.
    pub(crate) fn snapshot_cell(&self, index: u32) -> Option<Arc<SnapshotCell>> {
        let frames = self.frames.lock();
        frames
            .snapshots
            .binary_search_by_key(&index, |s| s.index)
            .ok()
            .map(|position| frames.snapshots[position].cell.clone())
    }

    /// Number of snapshots with a converted image.
    pub(crate) fn ready_count(&self) -> usize {
        self.frames
            .lock()
            .snapshots
            .iter()
            .filter(|snapshot| snapshot.cell.is_ready())
            .count()
    }

    /// Drop packets and frames, hand textures to the deferred-free queue, and
    /// mark the task dead. Idempotent.
    pub(crate) fn release_resources(&self) {
        let mut frames = self.frames.lock();
        self.status.store(TaskStatus::Dead.as_u8(), Ordering::Release);
        frames.candidates.clear();
        for snapshot in std::mem::take(&mut frames.snapshots) {
            self.discard(snapshot);
        }
        drop(frames);
        self.packets.lock().clear();
    }

    fn discard(&self, snapshot: Snapshot<F>) {
        if snapshot.raw.is_some() {
            self.unconverted.fetch_sub(1, Ordering::AcqRel);
            self.pending_frames.fetch_sub(1, Ordering::AcqRel);
        }
        snapshot.cell.retire(&self.deferred);
    }
}

impl<P, F> Drop for GopTask<P, F> {
    fn drop(&mut self) {
        self.release_resources();
    }
}
