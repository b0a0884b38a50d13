//! Error handling integration tests.
//!
//! These tests verify that meaningful errors are returned for invalid
//! configuration and misuse, and that they leave the engine usable.

mod common;

use common::{SyntheticBackend, SyntheticSource, fast_options, open_engine};
use snapcache::{Engine, PixelFormat, SnapcacheError};

#[test]
fn open_missing_source() {
    let mut engine = Engine::with_options(SyntheticBackend::new(SyntheticSource::default()), fast_options());
    let result = engine.open("synthetic://missing");
    assert!(result.is_err());

    let error_message = result.unwrap_err().to_string();
    assert!(
        error_message.contains("Failed to open media source"),
        "Error message should mention the open failure: {error_message}",
    );
    assert!(error_message.contains("synthetic://missing"));
}

#[test]
fn invalid_window_messages() {
    let (mut engine, _) = open_engine(SyntheticSource::default(), 10.0, 25.0);

    let error = engine.config_snap_window(10.0, 0.0).unwrap_err();
    assert!(error.to_string().contains("must be at least 1"), "{error}");

    let error = engine.config_snap_window(0.0, 10.0).unwrap_err();
    assert!(error.to_string().contains("must be positive"), "{error}");
}

#[test]
fn unsupported_format_message() {
    let source = SyntheticSource::default().supporting(vec![PixelFormat::Rgba8]);
    let (mut engine, _) = open_engine(source, 10.0, 25.0);

    let error = engine.set_color_format(PixelFormat::Rgb8).unwrap_err();
    assert!(matches!(error, SnapcacheError::UnsupportedColorFormat(_)));
    assert!(error.to_string().contains("Rgb8"), "{error}");
}

#[test]
fn engine_usable_after_errors() {
    let (mut engine, _) = open_engine(SyntheticSource::default(), 10.0, 25.0);
    assert!(engine.set_snapshot_size(0, 0).is_err());
    assert!(engine.set_cache_factor(f64::NAN).is_err());

    let viewer = engine.create_viewer(1.0).expect("Engine should still accept viewers");
    common::settle(&engine, &viewer, 1.0);
}

#[test]
fn viewer_errors_after_close() {
    let (mut engine, _) = open_engine(SyntheticSource::default(), 10.0, 25.0);
    let viewer = engine.create_viewer(0.0).expect("Failed to create viewer");
    engine.close();

    let error = viewer.snapshots(0.0).unwrap_err();
    assert_eq!(error.to_string(), "Engine has no opened source");
}

#[test]
fn thread_spawn_error_display() {
    let error = SnapcacheError::ThreadSpawn {
        name: "snapcache-demux",
        reason: "resource temporarily unavailable".to_string(),
    };
    assert_eq!(
        error.to_string(),
        "Failed to spawn snapcache-demux thread: resource temporarily unavailable"
    );
}
