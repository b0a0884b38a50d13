//! EngineOptions, SnapshotOutputOptions and PixelFormat tests.

use std::time::Duration;

use snapcache::{
    DecoderOptions, EngineOptions, InterpolationMode, PixelFormat, SnapshotOutputOptions,
};

// ── EngineOptions builder ────────────────────────────────────────

#[test]
fn engine_options_defaults() {
    let options = EngineOptions::new();
    assert_eq!(options.cache_factor(), 4.0);
    assert!(options.decoder().hardware_acceleration);
    assert_eq!(options.decoder().threads, None);
    assert_eq!(options.output(), &SnapshotOutputOptions::default());

    let debug = format!("{options:?}");
    assert!(debug.contains("packet_queue_depth: 64"));
    assert!(debug.contains("max_pending_frames: 32"));
    assert!(debug.contains("max_demuxed_tasks: 4"));
}

#[test]
fn engine_options_clamp_counts() {
    let options = EngineOptions::new()
        .with_packet_queue_depth(0)
        .with_max_pending_frames(0)
        .with_max_demuxed_tasks(0);
    let debug = format!("{options:?}");
    // Clamped to 1.
    assert!(debug.contains("packet_queue_depth: 1"));
    assert!(debug.contains("max_pending_frames: 1"));
    assert!(debug.contains("max_demuxed_tasks: 1"));
}

#[test]
fn engine_options_cache_factor_floor() {
    assert_eq!(EngineOptions::new().with_cache_factor(0.0).cache_factor(), 1.0);
    assert_eq!(EngineOptions::new().with_cache_factor(2.5).cache_factor(), 2.5);
    assert_eq!(
        EngineOptions::new()
            .with_cache_factor(f64::INFINITY)
            .cache_factor(),
        1.0
    );
}

#[test]
fn engine_options_decoder_settings() {
    let options = EngineOptions::new().with_hardware_acceleration(false);
    assert!(!options.decoder().hardware_acceleration);

    let options = EngineOptions::new().with_decoder(DecoderOptions {
        hardware_acceleration: true,
        threads: Some(2),
    });
    assert_eq!(options.decoder().threads, Some(2));
}

#[test]
fn engine_options_snap_window() {
    let options = EngineOptions::new()
        .with_snap_window(Duration::from_secs(30), 12.0)
        .with_idle_sleep(Duration::from_millis(1));
    let debug = format!("{options:?}");
    assert!(debug.contains("window_size: 30s"));
    assert!(debug.contains("window_frame_count: 12.0"));
    assert!(debug.contains("idle_sleep: 1ms"));
}

// ── SnapshotOutputOptions ────────────────────────────────────────

#[test]
fn output_explicit_resolution_wins() {
    let output = SnapshotOutputOptions::new()
        .with_resize_factor(0.5, 0.5)
        .with_resolution(Some(100), Some(50))
        .resolve(1920, 1080);
    assert_eq!((output.width, output.height), (100, 50));
}

#[test]
fn output_single_dimension_keeps_aspect_ratio() {
    let output = SnapshotOutputOptions::new()
        .with_resolution(None, Some(90))
        .resolve(1920, 1080);
    assert_eq!((output.width, output.height), (160, 90));
}

#[test]
fn output_single_dimension_without_aspect_ratio_uses_factor() {
    let output = SnapshotOutputOptions::new()
        .with_maintain_aspect_ratio(false)
        .with_resize_factor(0.5, 0.25)
        .with_resolution(Some(100), None)
        .resolve(1920, 1080);
    assert_eq!((output.width, output.height), (100, 270));
}

#[test]
fn output_resize_factor_never_reaches_zero() {
    let output = SnapshotOutputOptions::new()
        .with_resize_factor(0.0001, 0.0001)
        .resolve(640, 360);
    assert_eq!((output.width, output.height), (1, 1));
}

#[test]
fn output_carries_format_and_interpolation() {
    let output = SnapshotOutputOptions::new()
        .with_pixel_format(PixelFormat::Gray8)
        .with_interpolation(InterpolationMode::Bicubic)
        .resolve(64, 36);
    assert_eq!(output.pixel_format, PixelFormat::Gray8);
    assert_eq!(output.interpolation, InterpolationMode::Bicubic);
}

// ── PixelFormat ──────────────────────────────────────────────────

#[test]
fn pixel_format_default_is_rgba() {
    assert_eq!(PixelFormat::default(), PixelFormat::Rgba8);
}

#[test]
fn pixel_format_bytes_per_pixel() {
    let sizes: Vec<usize> = PixelFormat::ALL
        .iter()
        .map(|format| format.bytes_per_pixel())
        .collect();
    assert_eq!(sizes, vec![3, 4, 1]);
}

#[test]
fn interpolation_maps_to_image_filters() {
    use image::imageops::FilterType;

    assert_eq!(InterpolationMode::Nearest.to_filter_type(), FilterType::Nearest);
    assert_eq!(InterpolationMode::default().to_filter_type(), FilterType::Triangle);
}
