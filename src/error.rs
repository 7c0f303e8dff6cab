//! Error type for device, buffer and session operations.
//!
//! Every variant names the operation that failed. Variants wrapping a driver
//! call keep the underlying `std::io::Error` as their source so the OS status
//! code stays reachable through [`CameraError::os_code`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pool::BufferState;

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Error type for camera operations.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The device node could not be opened.
    #[error("failed to open device '{}': {source}", path.display())]
    DeviceOpen {
        /// Device path that was requested.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QUERYCAP` was rejected.
    #[error("VIDIOC_QUERYCAP failed: {0}")]
    Query(#[source] io::Error),

    /// The device answered the capability query but cannot stream video capture.
    #[error("'{card}' is not a streaming video capture device (capabilities {capabilities:#010X})")]
    NotCaptureDevice {
        /// Card name reported by the driver.
        card: String,
        /// Capability bitmask reported by the driver.
        capabilities: u32,
    },

    /// `VIDIOC_S_FMT` was rejected.
    #[error("VIDIOC_S_FMT failed: {0}")]
    Format(#[source] io::Error),

    /// `VIDIOC_G_PARM` was rejected. Callers may continue with device defaults.
    #[error("VIDIOC_G_PARM failed: {0}")]
    ParameterQuery(#[source] io::Error),

    /// `VIDIOC_REQBUFS` failed or granted no buffers.
    #[error("VIDIOC_REQBUFS for {requested} buffers failed: {source}")]
    Allocation {
        /// Number of buffers requested.
        requested: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QUERYBUF` or `mmap` failed for one buffer.
    #[error("mapping buffer {index} failed: {source}")]
    Mapping {
        /// Buffer index.
        index: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QBUF` failed.
    #[error("VIDIOC_QBUF for buffer {index} failed: {source}")]
    Enqueue {
        /// Buffer index.
        index: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_DQBUF` failed.
    #[error("VIDIOC_DQBUF failed: {0}")]
    Dequeue(#[source] io::Error),

    /// No buffer was filled within the configured wait.
    #[error("no frame dequeued within {0:?}")]
    Timeout(Duration),

    /// `VIDIOC_STREAMON` was rejected.
    #[error("VIDIOC_STREAMON failed: {0}")]
    StreamStart(#[source] io::Error),

    /// `VIDIOC_STREAMOFF` was rejected.
    #[error("VIDIOC_STREAMOFF failed: {0}")]
    StreamStop(#[source] io::Error),

    /// A dequeue or enqueue failed while capturing frame `sequence`.
    #[error("capture of frame {sequence} failed: {source}")]
    Capture {
        /// Session sequence number of the frame being captured.
        sequence: u32,
        /// The dequeue or enqueue failure.
        #[source]
        source: Box<CameraError>,
    },

    /// The frame sink could not persist a frame. Never fatal to the session.
    #[error("writing frame {sequence} failed: {source}")]
    SinkWrite {
        /// Session sequence number of the lost frame.
        sequence: u32,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The output directory for frames could not be created.
    #[error("cannot prepare output directory '{}': {source}", path.display())]
    OutputDir {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The driver reported more valid bytes than the buffer holds.
    #[error("buffer {index} reports {bytes_used} bytes used but is only {length} bytes long")]
    PayloadOverrun {
        /// Buffer index.
        index: u32,
        /// Bytes the driver claims to have written.
        bytes_used: u32,
        /// Mapped region length.
        length: usize,
    },

    /// A buffer was used in a state that does not allow the operation.
    #[error("buffer {index} is {actual:?}, cannot {operation}")]
    BufferState {
        /// Buffer index.
        index: u32,
        /// Attempted operation.
        operation: &'static str,
        /// State the buffer was in.
        actual: BufferState,
    },

    /// A buffer index outside the granted pool.
    #[error("buffer index {index} out of range for a pool of {count}")]
    InvalidIndex {
        /// Offending index.
        index: u32,
        /// Number of buffers in the pool.
        count: usize,
    },

    /// An operation was attempted before its preconditions were met.
    #[error("cannot {operation}: {reason}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Missing precondition.
        reason: &'static str,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CameraError {
    /// The OS status code behind this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::DeviceOpen { source, .. }
            | Self::Allocation { source, .. }
            | Self::Mapping { source, .. }
            | Self::Enqueue { source, .. }
            | Self::SinkWrite { source, .. }
            | Self::OutputDir { source, .. } => source.raw_os_error(),
            Self::Query(source)
            | Self::Format(source)
            | Self::ParameterQuery(source)
            | Self::Dequeue(source)
            | Self::StreamStart(source)
            | Self::StreamStop(source) => source.raw_os_error(),
            Self::Capture { source, .. } => source.os_code(),
            _ => None,
        }
    }

    /// Whether the error indicates the device itself is gone or broken.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self.os_code(),
            Some(libc::ENODEV | libc::ENXIO | libc::EIO | libc::EPIPE)
        )
    }

    /// Whether the error must end the capture session.
    ///
    /// Sink failures, frame-parameter queries and timeouts are recoverable;
    /// per-frame queue failures are fatal only when the device is lost.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SinkWrite { .. } | Self::ParameterQuery(_) | Self::Timeout(_) => false,
            Self::Capture { source, .. } => match source.as_ref() {
                Self::Timeout(_) => false,
                Self::Dequeue(_) | Self::Enqueue { .. } => source.is_device_lost(),
                _ => true,
            },
            _ => true,
        }
    }
}

impl From<figment::Error> for CameraError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
