//! Snapshot window geometry.
//!
//! [`SnapGeometry`] holds the constants derived from the source and the
//! current window configuration (snapshot interval, cache size, padding,
//! last valid index). [`SnapGeometry::compute_window`] is the pure function
//! that maps a viewer position to a [`SnapWindow`].

use crate::backend::SourceInfo;
use crate::conversion::TimeBase;
use crate::seek_index::SeekIndex;

/// The view and cache index ranges of one viewer position.
///
/// Invariant: `cache_index0 <= view_index0 <= view_index1 <= cache_index1`,
/// all within `[0, max_index]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapWindow {
    /// Window start position in seconds, as requested.
    pub window_pos: f64,
    /// First snapshot index shown.
    pub view_index0: u32,
    /// Last snapshot index shown (inclusive).
    pub view_index1: u32,
    /// First snapshot index kept materialized.
    pub cache_index0: u32,
    /// Last snapshot index kept materialized (inclusive).
    pub cache_index1: u32,
    /// Pts decoding must start from to cover the cache range.
    pub seek_bound_low: i64,
    /// Pts (exclusive) decoding may stop at once the cache range is covered.
    pub seek_bound_high: i64,
}

impl SnapWindow {
    /// Whether both windows cover the same indices.
    pub fn same_indices(&self, other: &SnapWindow) -> bool {
        self.view_index0 == other.view_index0
            && self.view_index1 == other.view_index1
            && self.cache_index0 == other.cache_index0
            && self.cache_index1 == other.cache_index1
    }

    /// Number of snapshots in the view range.
    pub fn view_len(&self) -> u32 {
        self.view_index1 - self.view_index0 + 1
    }
}

/// Constants derived from the source and the snapshot window settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapGeometry {
    window_size_ms: f64,
    window_frame_count: f64,
    cache_factor: f64,
    frame_interval_ms: f64,
    duration_ms: f64,
    snapshot_interval_ms: f64,
    snapshot_interval_pts: f64,
    half_frame_interval_pts: i64,
    time_base: TimeBase,
    start_pts: i64,
    max_index: u32,
    view_frame_count: u32,
    cache_size: u32,
    prev_pad: u32,
}

impl SnapGeometry {
    /// Derive the geometry for `window_size_ms` milliseconds showing
    /// `window_frame_count` snapshots.
    ///
    /// The snapshot interval never drops below the source frame interval.
    /// Arguments are assumed validated by the caller.
    pub fn new(
        info: &SourceInfo,
        window_size_ms: f64,
        window_frame_count: f64,
        cache_factor: f64,
    ) -> Self {
        let frame_interval_ms = info.frame_interval_ms.max(f64::EPSILON);
        let snapshot_interval_ms = (window_size_ms / window_frame_count).max(frame_interval_ms);
        let snapshot_interval_pts = info
            .time_base
            .millis_to_ticks(snapshot_interval_ms)
            .max(f64::EPSILON);
        let half_frame_interval_pts =
            (info.time_base.millis_to_ticks(frame_interval_ms) / 2.0).round() as i64;

        let max_index = ((info.duration_ms - frame_interval_ms) / snapshot_interval_ms)
            .floor()
            .max(0.0) as u32;

        let view_frame_count = window_frame_count.ceil().max(1.0) as u32;
        let cache_size = ((window_frame_count * cache_factor).ceil() as u32).max(view_frame_count + 1);
        let prev_pad = (cache_size - view_frame_count) / 2;

        Self {
            window_size_ms,
            window_frame_count,
            cache_factor,
            frame_interval_ms,
            duration_ms: info.duration_ms,
            snapshot_interval_ms,
            snapshot_interval_pts,
            half_frame_interval_pts,
            time_base: info.time_base,
            start_pts: info.start_pts,
            max_index,
            view_frame_count,
            cache_size,
            prev_pad,
        }
    }

    /// Window size in milliseconds.
    pub fn window_size_ms(&self) -> f64 {
        self.window_size_ms
    }

    /// Number of snapshots the window is configured to show.
    pub fn window_frame_count(&self) -> f64 {
        self.window_frame_count
    }

    /// Cache factor the geometry was derived with.
    pub fn cache_factor(&self) -> f64 {
        self.cache_factor
    }

    /// Time between two snapshot indices, in milliseconds.
    pub fn snapshot_interval_ms(&self) -> f64 {
        self.snapshot_interval_ms
    }

    /// Time between two snapshot indices, in pts units.
    pub fn snapshot_interval_pts(&self) -> f64 {
        self.snapshot_interval_pts
    }

    /// Half the source frame interval, in pts units.
    pub fn half_frame_interval_pts(&self) -> i64 {
        self.half_frame_interval_pts
    }

    /// Last valid snapshot index.
    pub fn max_index(&self) -> u32 {
        self.max_index
    }

    /// Number of snapshots kept materialized per viewer.
    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    /// Cache padding before the view range.
    pub fn prev_pad(&self) -> u32 {
        self.prev_pad
    }

    /// Ideal timestamp of `index`, in milliseconds from stream start.
    pub fn index_to_millis(&self, index: u32) -> f64 {
        f64::from(index) * self.snapshot_interval_ms
    }

    /// Ideal pts of `index`.
    pub fn index_to_pts(&self, index: u32) -> i64 {
        self.start_pts + (f64::from(index) * self.snapshot_interval_pts).round() as i64
    }

    /// Milliseconds from stream start of `pts`.
    pub fn pts_to_millis(&self, pts: i64) -> f64 {
        self.time_base.pts_to_millis(pts - self.start_pts)
    }

    /// Nearest snapshot index of `pts` and its bias (absolute pts distance
    /// to the index's ideal pts). The index may be negative or past
    /// [`max_index`](SnapGeometry::max_index).
    pub fn nearest_index(&self, pts: i64) -> (i64, i64) {
        let offset = (pts - self.start_pts) as f64;
        let index = (offset / self.snapshot_interval_pts).round() as i64;
        let ideal = (index as f64 * self.snapshot_interval_pts).round() as i64;
        (index, (offset as i64 - ideal).abs())
    }

    /// Map a viewer position (seconds) to its view and cache windows.
    ///
    /// When the padded cache range would run off either end of the
    /// timeline it is shifted back in bounds, keeping its full size where
    /// the timeline is long enough.
    pub fn compute_window(&self, pos: f64, seek_index: &SeekIndex) -> SnapWindow {
        let pos_ms = if pos.is_finite() { pos * 1_000.0 } else { 0.0 };
        let to_index = |millis: f64| {
            ((millis / self.snapshot_interval_ms).floor().max(0.0) as u64)
                .min(u64::from(self.max_index)) as u32
        };

        let view_index0 = to_index(pos_ms);
        let view_index1 = to_index(pos_ms + self.window_size_ms).max(view_index0);

        let mut cache_index0 = view_index0.saturating_sub(self.prev_pad);
        let mut cache_index1 = cache_index0.saturating_add(self.cache_size - 1);
        if cache_index1 > self.max_index {
            cache_index1 = self.max_index;
            cache_index0 = self
                .max_index
                .saturating_sub(self.cache_size - 1)
                .min(view_index0);
        }
        let cache_index1 = cache_index1.max(view_index1);

        SnapWindow {
            window_pos: pos,
            view_index0,
            view_index1,
            cache_index0,
            cache_index1,
            seek_bound_low: seek_index.seek_bounds_for_index(cache_index0, self).low,
            seek_bound_high: seek_index.seek_bounds_for_index(cache_index1, self).high,
        }
    }

    /// Source duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    /// Source frame interval in milliseconds.
    pub fn frame_interval_ms(&self) -> f64 {
        self.frame_interval_ms
    }
}
