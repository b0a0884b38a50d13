//! Window geometry and GOP range construction tests.
//!
//! These exercise the pure parts of the engine: mapping positions to index
//! windows and covering index spans with GOP-aligned task ranges.

mod common;

use common::SyntheticSource;
use snapcache::{SeekIndex, SnapGeometry, SourceInfo, TimeBase};

fn geometry_for(info: &SourceInfo, window_ms: f64, frame_count: f64, cache_factor: f64) -> (SnapGeometry, SeekIndex) {
    let geometry = SnapGeometry::new(info, window_ms, frame_count, cache_factor);
    let seek_index = SeekIndex::new(
        info.keyframes.clone(),
        info.start_pts,
        geometry.half_frame_interval_pts(),
    );
    (geometry, seek_index)
}

fn positions(until_seconds: f64, step: f64) -> impl Iterator<Item = f64> {
    let steps = (until_seconds / step).ceil() as usize;
    (0..=steps).map(move |step_index| step_index as f64 * step)
}

// ── Derived constants ───────────────────────────────────────────────

#[test]
fn derived_constants_for_forty_millisecond_source() {
    let info = SyntheticSource::default().info();
    let (geometry, _) = geometry_for(&info, 10_000.0, 20.0, 2.0);

    assert_eq!(geometry.snapshot_interval_ms(), 500.0);
    assert_eq!(geometry.max_index(), 119);
    assert_eq!(geometry.cache_size(), 40);
    assert_eq!(geometry.prev_pad(), 10);
    assert_eq!(geometry.half_frame_interval_pts(), 20);
    assert_eq!(geometry.index_to_millis(3), 1_500.0);
    assert_eq!(geometry.index_to_pts(3), 1_500);
}

#[test]
fn derived_constants_respect_time_base_and_start() {
    let info = SyntheticSource::default()
        .with_time_base(TimeBase::new(1, 90_000), 3_600)
        .with_start_pts(900)
        .info();
    let (geometry, _) = geometry_for(&info, 10_000.0, 20.0, 2.0);

    assert!((geometry.snapshot_interval_ms() - 500.0).abs() < 1e-6);
    assert!((geometry.snapshot_interval_pts() - 45_000.0).abs() < 1e-6);
    assert_eq!(geometry.half_frame_interval_pts(), 1_800);
    assert_eq!(geometry.index_to_pts(2), 900 + 90_000);
    assert!((geometry.pts_to_millis(900 + 90_000) - 1_000.0).abs() < 1e-6);
    assert_eq!(geometry.nearest_index(900 + 90_000 + 3_600), (2, 3_600));
}

// ── Window invariants ───────────────────────────────────────────────

fn assert_window_invariants(geometry: &SnapGeometry, seek_index: &SeekIndex, pos: f64) {
    let window = geometry.compute_window(pos, seek_index);
    let context = format!("pos {pos}: {window:?}");

    assert!(window.cache_index0 <= window.view_index0, "{context}");
    assert!(window.view_index0 <= window.view_index1, "{context}");
    assert!(window.view_index1 <= window.cache_index1, "{context}");
    assert!(window.cache_index1 <= geometry.max_index(), "{context}");

    if geometry.max_index() + 1 >= geometry.cache_size() {
        assert_eq!(
            window.cache_index1 - window.cache_index0 + 1,
            geometry.cache_size(),
            "{context}"
        );
    }

    let tolerance = geometry.half_frame_interval_pts();
    assert!(
        window.seek_bound_low - tolerance <= geometry.index_to_pts(window.cache_index0),
        "{context}"
    );
    assert!(
        window.seek_bound_high == i64::MAX
            || geometry.index_to_pts(window.cache_index1) <= window.seek_bound_high - tolerance,
        "{context}"
    );
}

#[test]
fn window_invariants_hold_across_the_timeline() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    for pos in positions(70.0, 0.173) {
        assert_window_invariants(&geometry, &seek_index, pos);
    }
}

#[test]
fn window_invariants_hold_for_short_source() {
    // Shorter than one cache window.
    let info = SyntheticSource::default().with_frame_count(100).info();
    let (geometry, seek_index) = geometry_for(&info, 2_000.0, 10.0, 4.0);
    assert!(geometry.max_index() + 1 < geometry.cache_size());

    for pos in positions(5.0, 0.05) {
        assert_window_invariants(&geometry, &seek_index, pos);
        let window = geometry.compute_window(pos, &seek_index);
        assert_eq!(window.cache_index0, 0);
        assert_eq!(window.cache_index1, geometry.max_index());
    }
}

#[test]
fn window_invariants_hold_with_odd_time_base() {
    let info = SyntheticSource::default()
        .with_time_base(TimeBase::new(1001, 30_000), 1)
        .with_start_pts(3)
        .with_gop_size(12)
        .info();
    let (geometry, seek_index) = geometry_for(&info, 7_300.0, 9.0, 3.0);

    for pos in positions(info.duration_seconds() + 2.0, 0.311) {
        assert_window_invariants(&geometry, &seek_index, pos);
    }
}

#[test]
fn negative_and_non_finite_positions_map_to_start() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    for pos in [-5.0, f64::NAN, f64::NEG_INFINITY] {
        let window = geometry.compute_window(pos, &seek_index);
        assert_eq!(window.view_index0, 0);
        assert_eq!(window.cache_index0, 0);
    }
}

#[test]
fn window_past_the_end_is_shifted_back() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    let window = geometry.compute_window(1_000.0, &seek_index);
    assert_eq!(window.view_index0, geometry.max_index());
    assert_eq!(window.view_index1, geometry.max_index());
    assert_eq!(window.cache_index1, geometry.max_index());
    assert_eq!(window.cache_index0, geometry.max_index() + 1 - geometry.cache_size());
}

// ── Range coverage ──────────────────────────────────────────────────

fn assert_covers(geometry: &SnapGeometry, seek_index: &SeekIndex, index0: u32, index1: u32) -> usize {
    let ranges = seek_index.ranges_from_index_span(index0, index1, geometry);
    assert!(!ranges.is_empty());

    let first = &ranges[0];
    let last = &ranges[ranges.len() - 1];
    assert!(first.index_range.start <= index0);
    assert!(last.index_range.end > index1.min(geometry.max_index()));
    assert!(last.index_range.end <= geometry.max_index() + 1);

    for pair in ranges.windows(2) {
        assert_eq!(pair[0].index_range.end, pair[1].index_range.start);
        assert!(pair[0].seek_bounds.high <= pair[1].seek_bounds.low);
    }
    for range in &ranges {
        assert!(!range.index_range.is_empty(), "{range:?}");
        for index in range.index_range.clone() {
            assert_eq!(seek_index.seek_bounds_for_index(index, geometry), range.seek_bounds);
        }
    }
    ranges.len()
}

#[test]
fn ranges_cover_spans_with_regular_gops() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    // One-second GOPs, 400 ms snapshots.
    for (index0, index1) in [(0, 49), (7, 8), (12, 61), (100, 149), (149, 149)] {
        assert_covers(&geometry, &seek_index, index0, index1);
    }
}

#[test]
fn ranges_cover_spans_with_dense_keyframes() {
    let info = SyntheticSource::default().with_gop_size(1).info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    // Every frame is a keyframe: each snapshot gets its own GOP.
    let count = assert_covers(&geometry, &seek_index, 10, 40);
    assert_eq!(count, 31);
}

#[test]
fn ranges_cover_spans_with_sparse_keyframes() {
    let info = SyntheticSource::default().with_gop_size(250).info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    let count = assert_covers(&geometry, &seek_index, 20, 70);
    assert!(count <= 3, "ten-second GOPs, got {count} range(s)");
}

#[test]
fn ranges_cover_spans_with_irregular_keyframes() {
    let info = SyntheticSource::default()
        .with_keyframes(vec![0, 3, 4, 90, 91, 400, 1_100])
        .info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    for (index0, index1) in [(0, 149), (5, 6), (30, 120)] {
        assert_covers(&geometry, &seek_index, index0, index1);
    }
}

#[test]
fn single_keyframe_yields_one_range() {
    let info = SyntheticSource::default().with_keyframes(vec![0]).info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    let ranges = seek_index.ranges_from_index_span(40, 60, &geometry);
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].index_range, 0..geometry.max_index() + 1);
    assert_eq!(ranges[0].seek_bounds.high, i64::MAX);
}

#[test]
fn identical_gops_produce_identical_ranges() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);

    let a = seek_index.ranges_from_index_span(10, 30, &geometry);
    let b = seek_index.ranges_from_index_span(12, 32, &geometry);
    assert_eq!(a, b);
}

// ── View annotation ─────────────────────────────────────────────────

#[test]
fn with_view_marks_overlap_and_distance() {
    let info = SyntheticSource::default().info();
    let (geometry, seek_index) = geometry_for(&info, 10_000.0, 25.0, 2.0);
    let ranges = seek_index.ranges_from_index_span(0, 60, &geometry);

    for range in ranges {
        let annotated = range.clone().with_view(20, 30);
        let overlaps = range.index_range.start <= 30 && range.index_range.end > 20;
        assert_eq!(annotated.in_view, overlaps, "{range:?}");
        if overlaps {
            assert_eq!(annotated.distance_to_view, 0);
        } else if range.index_range.start > 30 {
            assert_eq!(annotated.distance_to_view, range.index_range.start - 30);
        } else {
            assert_eq!(annotated.distance_to_view, 20 - (range.index_range.end - 1));
        }
    }
}
