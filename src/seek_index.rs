//! GOP-aligned seek bounds and task range construction.
//!
//! A [`SeekIndex`] holds the keyframe pts list of an opened source. It
//! answers two questions:
//!
//! - for a pts, which keyframe-to-keyframe span (GOP) must be decoded to
//!   reach it ([`seek_bounds`](SeekIndex::seek_bounds)),
//! - for a span of snapshot indices, which GOPs cover it
//!   ([`ranges_from_index_span`](SeekIndex::ranges_from_index_span)).
//!
//! Both use a half-frame-interval tolerance: a target that falls within half
//! a frame of the next keyframe belongs to the next GOP, so an ideal snapshot
//! timestamp landing a hair before a keyframe does not flap between two GOPs.

use std::ops::Range;

use crate::task::TaskRange;
use crate::window::SnapGeometry;

/// Keyframe-to-keyframe span, in pts. `high` is exclusive and is
/// [`i64::MAX`] for the last GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeekBounds {
    /// Pts of the keyframe decoding starts from.
    pub low: i64,
    /// Pts of the next keyframe, exclusive.
    pub high: i64,
}

/// Ordered keyframe list of an opened source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekIndex {
    /// Ascending, deduplicated GOP start pts. The first entry is never after
    /// the stream start.
    boundaries: Vec<i64>,
    start_pts: i64,
    tolerance: i64,
}

impl SeekIndex {
    /// Build an index from keyframe pts values.
    ///
    /// `tolerance` is half a frame interval in pts units. When the first
    /// keyframe comes after `start_pts` (or there are no keyframes at all),
    /// the stream start acts as an implicit seek point.
    pub fn new(mut keyframes: Vec<i64>, start_pts: i64, tolerance: i64) -> Self {
        keyframes.sort_unstable();
        keyframes.dedup();
        if keyframes.first().is_none_or(|&first| first > start_pts) {
            keyframes.insert(0, start_pts);
        }
        Self {
            boundaries: keyframes,
            start_pts,
            tolerance: tolerance.max(0),
        }
    }

    /// Number of GOPs.
    pub fn gop_count(&self) -> usize {
        self.boundaries.len()
    }

    /// GOP start pts values, ascending.
    pub fn keyframes(&self) -> &[i64] {
        &self.boundaries
    }

    /// Seek bounds `(first, second)` of the GOP containing `target_pts`,
    /// such that `first - tolerance <= target_pts < second - tolerance`.
    ///
    /// Targets before the first keyframe map to the first GOP.
    pub fn seek_bounds(&self, target_pts: i64) -> SeekBounds {
        let position = self
            .boundaries
            .partition_point(|&keyframe| keyframe.saturating_sub(self.tolerance) <= target_pts);
        self.bounds_of(position.max(1) - 1)
    }

    /// Seek bounds of the GOP responsible for snapshot `index`.
    pub fn seek_bounds_for_index(&self, index: u32, geometry: &SnapGeometry) -> SeekBounds {
        self.bounds_of(self.gop_for_index(index, geometry))
    }

    /// Build GOP-aligned task ranges covering `index0..=index1`.
    ///
    /// The returned ranges are contiguous and non-overlapping. Each one
    /// spans the full set of snapshot indices its GOP is responsible for
    /// (clamped to the valid index range), so the first range may start
    /// before `index0` and the last one may end after `index1`. Two calls
    /// that touch the same GOP therefore produce identical ranges, which is
    /// what lets the scheduler deduplicate requests across viewers.
    ///
    /// View flags are left unset; see [`TaskRange::with_view`].
    pub fn ranges_from_index_span(
        &self,
        index0: u32,
        index1: u32,
        geometry: &SnapGeometry,
    ) -> Vec<TaskRange> {
        let index1 = index1.min(geometry.max_index());
        let mut ranges = Vec::new();
        let mut index = index0;
        while index <= index1 {
            let gop = self.gop_for_index(index, geometry);
            let span = self.index_span_of(gop, geometry);
            debug_assert!(span.contains(&index));
            let next = span.end;
            ranges.push(TaskRange::new(self.bounds_of(gop), span));
            index = next;
        }
        ranges
    }

    fn bounds_of(&self, gop: usize) -> SeekBounds {
        SeekBounds {
            low: self.boundaries[gop],
            high: self.boundaries.get(gop + 1).copied().unwrap_or(i64::MAX),
        }
    }

    /// First snapshot index whose ideal pts is at or after
    /// `keyframe - tolerance`. May be negative for the first GOP.
    fn first_index_of(&self, keyframe: i64, geometry: &SnapGeometry) -> i64 {
        let offset = (keyframe - self.start_pts - self.tolerance) as f64;
        (offset / geometry.snapshot_interval_pts()).ceil() as i64
    }

    fn gop_for_index(&self, index: u32, geometry: &SnapGeometry) -> usize {
        let index = i64::from(index);
        let position = self
            .boundaries
            .partition_point(|&keyframe| self.first_index_of(keyframe, geometry) <= index);
        position.max(1) - 1
    }

    fn index_span_of(&self, gop: usize, geometry: &SnapGeometry) -> Range<u32> {
        let limit = i64::from(geometry.max_index()) + 1;
        let first = self
            .first_index_of(self.boundaries[gop], geometry)
            .clamp(0, limit);
        let second = match self.boundaries.get(gop + 1) {
            Some(&next) => self.first_index_of(next, geometry).clamp(first, limit),
            None => limit,
        };
        first as u32..second as u32
    }
}
