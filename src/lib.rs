//! mmap-cam-capture: bounded V4L2 frame capture over memory-mapped buffers.
//!
//! The library walks a capture device through the V4L2 streaming-I/O
//! sequence: capability query, format negotiation, buffer allocation and
//! mapping, a queue/dequeue loop, and teardown. Buffer ownership is tracked
//! explicitly so userspace never reads a buffer the driver is filling.
//!
//! Driver calls go through the [`VideoDriver`] trait, so everything above it
//! runs against real hardware ([`V4L2Driver`]) or a mock in unit tests.
//!
//! ```no_run
//! use mmap_cam_capture::{capture_frames, CaptureConfig, DeviceHandle, FileSink};
//!
//! let config = CaptureConfig::default();
//! let mut handle = DeviceHandle::open(&config.device)?;
//! let mut sink = FileSink::new(&config.output_dir, &config.file_extension)?;
//! let summary = capture_frames(&mut handle, &config, &mut sink)?;
//! println!("captured {} frames", summary.frames_captured);
//! handle.close();
//! # Ok::<(), mmap_cam_capture::CameraError>(())
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod pool;
pub mod session;
pub mod sink;
pub mod traits;
pub mod v4l2;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use device::DeviceHandle;
pub use error::{CameraError, Result};
pub use pool::{BufferPool, BufferState, MappedBuffer};
pub use session::{capture_frames, CaptureReport, CaptureSession, CaptureSummary, SessionState};
pub use sink::{FileSink, FrameSink};
pub use traits::{
    BufferInfo, Capability, FieldOrder, Format, FormatRequest, FourCC, Frame, FrameInterval,
    FrameMetadata, VideoDriver,
};
pub use v4l2::V4L2Driver;
