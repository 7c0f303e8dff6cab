//! Capture a bounded number of frames from a V4L2 device into files.
//!
//! ```bash
//! # Five 1280x720 MJPG frames from /dev/video0 into the current directory
//! mmap-cam-capture
//!
//! # Ten frames from another device into ./frames, with a 2s dequeue limit
//! mmap-cam-capture /dev/video2 --frames 10 --output frames --timeout-ms 2000
//! ```
//!
//! Settings come from built-in defaults, an optional `--config` TOML file and
//! `MMAP_CAM_*` environment variables; flags given here override all three.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::info;

use mmap_cam_capture::{
    capture_frames, logging, CameraError, CaptureConfig, DeviceHandle, FieldOrder, FileSink,
};

#[derive(Parser, Debug)]
#[command(name = "mmap-cam-capture", version)]
#[command(about = "Capture frames from a V4L2 device using memory-mapped buffers", long_about = None)]
struct Cli {
    /// Device node to capture from
    #[arg(value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Frame width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Pixel format fourcc, e.g. MJPG or YUYV
    #[arg(short, long)]
    format: Option<String>,

    /// Field order
    #[arg(long, value_enum)]
    field: Option<FieldArg>,

    /// Number of buffers to request
    #[arg(short, long)]
    buffers: Option<u32>,

    /// Number of frames to capture
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    /// Directory to write frames into
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Give up on a frame after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FieldArg {
    Any,
    Progressive,
    Top,
    Bottom,
    Interlaced,
}

impl From<FieldArg> for FieldOrder {
    fn from(arg: FieldArg) -> Self {
        match arg {
            FieldArg::Any => Self::Any,
            FieldArg::Progressive => Self::Progressive,
            FieldArg::Top => Self::Top,
            FieldArg::Bottom => Self::Bottom,
            FieldArg::Interlaced => Self::Interlaced,
        }
    }
}

impl Cli {
    fn apply(self, config: &mut CaptureConfig) {
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(format) = self.format {
            config.pixel_format = format;
        }
        if let Some(field) = self.field {
            config.field_order = field.into();
        }
        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        if let Some(frames) = self.frames {
            config.frame_limit = frames;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if self.timeout_ms.is_some() {
            config.dequeue_timeout_ms = self.timeout_ms;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

fn main() {
    if let Err(err) = run() {
        match err.os_code() {
            Some(code) => eprintln!("Error: {err} (os error {code})"),
            None => eprintln!("Error: {err}"),
        }
        process::exit(1);
    }
}

fn run() -> Result<(), CameraError> {
    let cli = Cli::parse();

    let mut config = CaptureConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    logging::init(&config.log_level);

    let mut sink = FileSink::new(&config.output_dir, &config.file_extension)?;
    let mut handle = DeviceHandle::open(&config.device)?;
    let result = capture_frames(&mut handle, &config, &mut sink);
    handle.close();
    let summary = result?;

    info!(
        frames = summary.frames_captured,
        dropped = summary.frames_dropped,
        discarded = summary.frames_discarded,
        "capture finished"
    );
    println!("Device: {} ({})", summary.capability.card, summary.capability.driver);
    println!(
        "Format: {}x{} {} {:?}",
        summary.format.width, summary.format.height, summary.format.fourcc, summary.format.field_order
    );
    if let Some(fps) = summary.frame_interval.and_then(|interval| interval.fps()) {
        println!("Rate:   {fps:.2} fps");
    }
    println!("Buffers: {}", summary.buffer_count);
    println!(
        "Frames: {} captured, {} written to {}",
        summary.frames_captured,
        summary.frames_captured - summary.frames_dropped,
        config.output_dir.display()
    );

    Ok(())
}
