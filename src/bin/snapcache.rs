use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use image::{DynamicImage, GenericImage, Rgba, imageops::FilterType};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use snapcache::{
    Engine, EngineOptions, FfmpegBackend, FfmpegLogLevel, InterpolationMode, PixelFormat,
    SnapshotImage, SnapshotOutputOptions, Viewer,
};

#[cfg(feature = "hardware")]
use snapcache::available_hardware_devices;

const CLI_AFTER_HELP: &str = "Examples:\n  snapcache info input.mp4 --json\n  snapcache sheet input.mp4 --out sheet.png --start 0:01:00 --window 30 --count 12 --progress\n  snapcache scrub input.mp4 --viewers 3 --step 2.5 --steps 20";

#[derive(Debug, Parser)]
#[command(
    name = "snapcache",
    version,
    about = "Timeline snapshot strips for video files",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional logging output (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Show a progress bar while snapshots decode.
    #[arg(long, global = true)]
    progress: bool,

    /// Allow overwriting existing output files.
    #[arg(long, global = true)]
    overwrite: bool,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Snapshot pixel format (rgb8, rgba8, gray8).
    #[arg(long, global = true)]
    pixel_format: Option<String>,

    /// Snapshot scaling filter (nearest, bilinear, bicubic, area).
    #[arg(long, global = true)]
    interpolation: Option<String>,

    /// Decoder thread count hint.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Decode in software even when hardware decoding is available.
    #[arg(long, global = true)]
    software: bool,

    /// Cache factor: how many windows' worth of snapshots stay warm.
    #[arg(long, global = true)]
    cache_factor: Option<f64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print source information and window limits.
    #[command(
        visible_alias = "probe",
        after_help = "Examples:\n  snapcache info input.mp4\n  snapcache info input.mp4 --json"
    )]
    Info {
        /// Input media path or URL.
        input: String,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Decode one window and write it as a contact sheet.
    #[command(
        after_help = "Examples:\n  snapcache sheet input.mp4 --out sheet.png\n  snapcache sheet input.mp4 --out sheet.jpg --start 90 --window 60 --count 20 --columns 5"
    )]
    Sheet {
        /// Input media path or URL.
        input: String,
        /// Output image path.
        #[arg(long)]
        out: PathBuf,
        /// Window start (seconds, MM:SS or HH:MM:SS).
        #[arg(long, default_value = "0")]
        start: String,
        /// Window size in seconds.
        #[arg(long, default_value_t = 30.0)]
        window: f64,
        /// Snapshots per window.
        #[arg(long, default_value_t = 10.0)]
        count: f64,
        /// Contact sheet columns.
        #[arg(long, default_value_t = 5)]
        columns: u32,
        /// Snapshot width in pixels (height follows the aspect ratio).
        #[arg(long, default_value_t = 240)]
        width: u32,
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 60.0)]
        timeout: f64,
        /// Print a JSON summary instead of status lines.
        #[arg(long)]
        json: bool,
    },

    /// Move several viewers along the timeline and report cache activity.
    #[command(
        after_help = "Examples:\n  snapcache scrub input.mp4 --viewers 2 --step 5\n  snapcache scrub input.mp4 --viewers 4 --step 1 --steps 50 --json"
    )]
    Scrub {
        /// Input media path or URL.
        input: String,
        /// Number of viewers, spread evenly over the timeline.
        #[arg(long, default_value_t = 2)]
        viewers: usize,
        /// Seconds every viewer moves per step.
        #[arg(long, default_value_t = 2.0)]
        step: f64,
        /// Number of steps.
        #[arg(long, default_value_t = 20)]
        steps: usize,
        /// Delay between steps in milliseconds.
        #[arg(long, default_value_t = 100)]
        interval: u64,
        /// Window size in seconds.
        #[arg(long, default_value_t = 30.0)]
        window: f64,
        /// Snapshots per window.
        #[arg(long, default_value_t = 10.0)]
        count: f64,
        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// List hardware decoders available to this FFmpeg build.
    #[cfg(feature = "hardware")]
    Hardware,
}

fn parse_timecode(value: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("time value cannot be empty".into());
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        return Ok(Duration::from_secs_f64(seconds.max(0.0)));
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("invalid time format: {trimmed}").into());
    }

    let (hours, minutes, seconds_str) = if parts.len() == 3 {
        (parts[0].parse::<u64>()?, parts[1].parse::<u64>()?, parts[2])
    } else {
        (0_u64, parts[0].parse::<u64>()?, parts[1])
    };

    let seconds = seconds_str.parse::<f64>()?;
    let total_seconds = (hours as f64 * 3600.0) + (minutes as f64 * 60.0) + seconds;
    Ok(Duration::from_secs_f64(total_seconds.max(0.0)))
}

fn parse_pixel_format(value: &str) -> Option<PixelFormat> {
    match value.to_ascii_lowercase().as_str() {
        "rgb8" | "rgb" => Some(PixelFormat::Rgb8),
        "rgba8" | "rgba" => Some(PixelFormat::Rgba8),
        "gray8" | "gray" | "greyscale" | "grayscale" => Some(PixelFormat::Gray8),
        _ => None,
    }
}

fn parse_interpolation(value: &str) -> Option<InterpolationMode> {
    match value.to_ascii_lowercase().as_str() {
        "nearest" | "point" => Some(InterpolationMode::Nearest),
        "bilinear" | "linear" => Some(InterpolationMode::Bilinear),
        "bicubic" | "cubic" => Some(InterpolationMode::Bicubic),
        "area" => Some(InterpolationMode::Area),
        _ => None,
    }
}

fn parse_log_level(value: &str) -> Option<FfmpegLogLevel> {
    match value.to_ascii_lowercase().as_str() {
        "quiet" => Some(FfmpegLogLevel::Quiet),
        "panic" => Some(FfmpegLogLevel::Panic),
        "fatal" => Some(FfmpegLogLevel::Fatal),
        "error" => Some(FfmpegLogLevel::Error),
        "warning" | "warn" => Some(FfmpegLogLevel::Warning),
        "info" => Some(FfmpegLogLevel::Info),
        "verbose" => Some(FfmpegLogLevel::Verbose),
        "debug" => Some(FfmpegLogLevel::Debug),
        "trace" => Some(FfmpegLogLevel::Trace),
        _ => None,
    }
}

fn init_logging(global: &GlobalOptions) {
    let level = match global.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn apply_global_options(global: &GlobalOptions) -> Result<EngineOptions, Box<dyn std::error::Error>> {
    if let Some(level) = &global.log_level {
        let parsed = parse_log_level(level).ok_or(format!("unsupported --log-level: {level}"))?;
        snapcache::set_ffmpeg_log_level(parsed);
    }

    let mut output = SnapshotOutputOptions::new();
    if let Some(format) = &global.pixel_format {
        let parsed =
            parse_pixel_format(format).ok_or(format!("unsupported --pixel-format: {format}"))?;
        output = output.with_pixel_format(parsed);
    }
    if let Some(mode) = &global.interpolation {
        let parsed =
            parse_interpolation(mode).ok_or(format!("unsupported --interpolation: {mode}"))?;
        output = output.with_interpolation(parsed);
    }

    let mut options = EngineOptions::new()
        .with_hardware_acceleration(!global.software)
        .with_output(output);
    if let Some(threads) = global.threads {
        let mut decoder = *options.decoder();
        decoder.threads = Some(threads.max(1));
        options = options.with_decoder(decoder);
    }
    if let Some(factor) = global.cache_factor {
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(format!("--cache-factor must be at least 1.0, got {factor}").into());
        }
        options = options.with_cache_factor(factor);
    }

    #[cfg(not(feature = "hardware"))]
    if global.software {
        eprintln!(
            "{} {}",
            "warning:".yellow().bold(),
            "--software has no effect without the `hardware` feature".yellow()
        );
    }

    Ok(options)
}

fn open_engine(
    input: &str,
    options: EngineOptions,
) -> Result<Engine<FfmpegBackend>, Box<dyn std::error::Error>> {
    let mut engine = Engine::with_options(FfmpegBackend::new(), options);
    engine.open(input)?;
    Ok(engine)
}

fn ensure_writable(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !overwrite {
        return Err(format!(
            "output file already exists: {} (use --overwrite)",
            path.display()
        )
        .into());
    }
    Ok(())
}

/// Poll `viewer` at `position` until every view snapshot is ready or
/// `timeout` elapses. Returns the last snapshot list.
fn wait_for_snapshots(
    viewer: &Viewer<FfmpegBackend>,
    position: f64,
    timeout: Duration,
    progress_bar: Option<&ProgressBar>,
) -> Result<Vec<SnapshotImage>, Box<dyn std::error::Error>> {
    let started = Instant::now();
    loop {
        let snapshots = viewer.snapshots(position)?;
        let ready = snapshots.iter().filter(|snapshot| snapshot.is_ready()).count();
        if let Some(pb) = progress_bar {
            pb.set_length(snapshots.len() as u64);
            pb.set_position(ready as u64);
        }
        if ready == snapshots.len() || started.elapsed() >= timeout {
            return Ok(snapshots);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Lay snapshots out in rows of `columns`, each scaled to `thumbnail_width`.
/// Placeholders become dark tiles.
fn compose_contact_sheet(
    snapshots: &[SnapshotImage],
    columns: u32,
    thumbnail_width: u32,
    filter: FilterType,
) -> DynamicImage {
    let columns = columns.max(1);
    let thumbnail_width = thumbnail_width.max(1);
    let rows = (snapshots.len() as u32).div_ceil(columns).max(1);

    let thumbnail_height = snapshots
        .iter()
        .find_map(SnapshotImage::image)
        .map(|image| {
            let scale_factor = thumbnail_width as f64 / image.width().max(1) as f64;
            ((image.height() as f64 * scale_factor).round() as u32).max(1)
        })
        .unwrap_or(thumbnail_width * 9 / 16)
        .max(1);

    let mut sheet = DynamicImage::new_rgba8(thumbnail_width * columns, thumbnail_height * rows);
    for (index, snapshot) in snapshots.iter().enumerate() {
        let column = (index as u32) % columns;
        let row = (index as u32) / columns;
        let x = column * thumbnail_width;
        let y = row * thumbnail_height;

        match snapshot.image() {
            Some(image) => {
                let thumbnail = image.resize_exact(thumbnail_width, thumbnail_height, filter);
                let _ = sheet.copy_from(&thumbnail, x, y);
            }
            None => {
                for dy in 0..thumbnail_height {
                    for dx in 0..thumbnail_width {
                        sheet.put_pixel(x + dx, y + dy, Rgba([24, 24, 24, 255]));
                    }
                }
            }
        }
    }
    sheet
}

fn format_timestamp(milliseconds: f64) -> String {
    let total = (milliseconds.max(0.0) / 1_000.0) as u64;
    let fraction = (milliseconds.max(0.0) % 1_000.0) as u64;
    format!(
        "{:02}:{:02}:{:02}.{fraction:03}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    )
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.global);
    let options = apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Info { input, json } => {
            let engine = open_engine(&input, options)?;
            let info = engine.source_info().ok_or("source closed unexpectedly")?;
            if json {
                let payload = json!({
                    "url": info.url,
                    "codec": info.codec,
                    "width": info.width,
                    "height": info.height,
                    "duration_seconds": info.duration_seconds(),
                    "frames_per_second": info.frames_per_second(),
                    "frame_count": info.frame_count,
                    "keyframes": info.keyframes.len(),
                    "hardware_accelerated": info.hardware_accelerated,
                    "min_window_seconds": engine.min_window_size(),
                    "max_window_seconds": engine.max_window_size(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("{} {}", "source:".bold(), info.url);
                println!(
                    "  {}x{} {} at {:.3} fps, {} frame(s)",
                    info.width,
                    info.height,
                    info.codec,
                    info.frames_per_second(),
                    info.frame_count
                );
                println!(
                    "  duration {}, {} keyframe(s){}",
                    format_timestamp(info.duration_ms),
                    info.keyframes.len(),
                    if info.hardware_accelerated {
                        ", hardware decoding"
                    } else {
                        ""
                    }
                );
                if let (Some(min), Some(max)) = (engine.min_window_size(), engine.max_window_size()) {
                    println!("  window size {min:.3} s .. {max:.3} s");
                }
            }
        }
        Commands::Sheet {
            input,
            out,
            start,
            window,
            count,
            columns,
            width,
            timeout,
            json,
        } => {
            ensure_writable(&out, cli.global.overwrite)?;
            let position = parse_timecode(&start)?.as_secs_f64();

            let mut engine = open_engine(&input, options)?;
            let applied = engine.config_snap_window(window, count)?;
            let viewer = engine.create_viewer(position)?;

            let progress_bar = if cli.global.progress {
                let pb = ProgressBar::new(count.ceil() as u64);
                let style = ProgressStyle::with_template(
                    "{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}",
                )?;
                pb.set_style(style.progress_chars("##-"));
                pb.set_message("decoding");
                Some(pb)
            } else {
                None
            };

            let snapshots = wait_for_snapshots(
                &viewer,
                position,
                Duration::from_secs_f64(timeout.max(0.0)),
                progress_bar.as_ref(),
            )?;
            if let Some(pb) = progress_bar {
                pb.finish_with_message("done");
            }

            let filter = engine.options().output().interpolation.to_filter_type();
            let sheet = compose_contact_sheet(&snapshots, columns, width, filter);
            sheet.save(&out)?;

            let ready = snapshots.iter().filter(|snapshot| snapshot.is_ready()).count();
            if json {
                let payload = json!({
                    "output": out.display().to_string(),
                    "window_seconds": applied,
                    "snapshots": snapshots.iter().map(|snapshot| json!({
                        "index": snapshot.index(),
                        "timestamp_ms": snapshot.timestamp_ms(),
                        "ready": snapshot.is_ready(),
                    })).collect::<Vec<_>>(),
                    "ready": ready,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                if ready < snapshots.len() {
                    eprintln!(
                        "{} {}",
                        "warning:".yellow().bold(),
                        format!("{} snapshot(s) still decoding after {timeout} s", snapshots.len() - ready)
                            .yellow()
                    );
                }
                println!(
                    "{} {}",
                    "success:".green().bold(),
                    format!(
                        "Wrote {ready}/{} snapshot(s) over {applied:.1} s to {}",
                        snapshots.len(),
                        out.display()
                    )
                    .green()
                );
            }
        }
        Commands::Scrub {
            input,
            viewers,
            step,
            steps,
            interval,
            window,
            count,
            json,
        } => {
            let mut engine = open_engine(&input, options)?;
            engine.config_snap_window(window, count)?;
            let duration = engine
                .max_window_size()
                .ok_or("source closed unexpectedly")?;

            let viewer_count = viewers.max(1);
            let mut positions: Vec<f64> = (0..viewer_count)
                .map(|index| duration * index as f64 / viewer_count as f64)
                .collect();
            let handles = positions
                .iter()
                .map(|&position| engine.create_viewer(position))
                .collect::<Result<Vec<_>, _>>()?;

            let mut samples = Vec::with_capacity(steps);
            for step_index in 0..steps {
                for (handle, position) in handles.iter().zip(positions.iter_mut()) {
                    *position = (*position + step).rem_euclid(duration.max(f64::EPSILON));
                    handle.snapshots(*position)?;
                }
                thread::sleep(Duration::from_millis(interval));
                let statistics = engine.statistics();
                if !json {
                    println!(
                        "{} tasks {:>3} (in view {:>3}, decoding {:>3}, decoded {:>3}, retired {:>3}) packets {:>5} pending {:>3} ready {:>4}",
                        format!("step {step_index:>3}").cyan().bold(),
                        statistics.tasks,
                        statistics.in_view_tasks,
                        statistics.decoding_tasks,
                        statistics.decoded_tasks,
                        statistics.retired_tasks,
                        statistics.queued_packets,
                        statistics.pending_frames,
                        statistics.ready_snapshots
                    );
                }
                samples.push(json!({
                    "step": step_index,
                    "tasks": statistics.tasks,
                    "in_view_tasks": statistics.in_view_tasks,
                    "decoding_tasks": statistics.decoding_tasks,
                    "decoded_tasks": statistics.decoded_tasks,
                    "retired_tasks": statistics.retired_tasks,
                    "queued_packets": statistics.queued_packets,
                    "pending_frames": statistics.pending_frames,
                    "ready_snapshots": statistics.ready_snapshots,
                    "generation": statistics.generation,
                }));
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&json!({ "samples": samples }))?);
            }
        }
        #[cfg(feature = "hardware")]
        Commands::Hardware => {
            let devices = available_hardware_devices();
            if devices.is_empty() {
                println!("{}", "no hardware decoders available".yellow());
            }
            for device in devices {
                println!("{device:?}");
            }
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}
