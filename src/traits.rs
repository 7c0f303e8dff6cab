//! Core traits and types for the V4L2 capture abstraction.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CameraError;

/// Pixel format representation (e.g., MJPG, YUYV, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// Plain JPEG stills.
    pub const JPEG: Self = Self::new(b"JPEG");

    /// The little-endian `u32` the kernel uses for this code.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Whether frames in this format are self-contained JPEG images.
    #[must_use]
    pub fn is_jpeg(self) -> bool {
        self == Self::MJPG || self == Self::JPEG
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::Config(format!("fourcc '{s}' must be 4 bytes long")))?;
        if !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(CameraError::Config(format!(
                "fourcc '{s}' must be printable ASCII"
            )));
        }
        Ok(Self(bytes))
    }
}

/// Interlacing of the captured image, as `enum v4l2_field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldOrder {
    /// Driver chooses.
    Any,
    /// Progressive scan.
    Progressive,
    /// Top field only.
    Top,
    /// Bottom field only.
    Bottom,
    /// Both fields interleaved line by line.
    #[default]
    Interlaced,
    /// Top field then bottom field, sequentially.
    SequentialTb,
    /// Bottom field then top field, sequentially.
    SequentialBt,
    /// Fields alternate between buffers.
    Alternate,
    /// Interleaved, top field transmitted first.
    InterlacedTb,
    /// Interleaved, bottom field transmitted first.
    InterlacedBt,
}

impl FieldOrder {
    /// Raw `v4l2_field` value.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Any => 0,
            Self::Progressive => 1,
            Self::Top => 2,
            Self::Bottom => 3,
            Self::Interlaced => 4,
            Self::SequentialTb => 5,
            Self::SequentialBt => 6,
            Self::Alternate => 7,
            Self::InterlacedTb => 8,
            Self::InterlacedBt => 9,
        }
    }

    /// Parse a raw `v4l2_field` value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Any),
            1 => Some(Self::Progressive),
            2 => Some(Self::Top),
            3 => Some(Self::Bottom),
            4 => Some(Self::Interlaced),
            5 => Some(Self::SequentialTb),
            6 => Some(Self::SequentialBt),
            7 => Some(Self::Alternate),
            8 => Some(Self::InterlacedTb),
            9 => Some(Self::InterlacedBt),
            _ => None,
        }
    }
}

/// Format requested from the driver. The driver may adjust any of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Field order.
    pub field_order: FieldOrder,
}

impl FormatRequest {
    /// Create a new format request with interlaced field order.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            field_order: FieldOrder::Interlaced,
        }
    }

    /// Override the field order.
    #[must_use]
    pub const fn with_field_order(mut self, field_order: FieldOrder) -> Self {
        self.field_order = field_order;
        self
    }
}

/// Video format as actually set by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Field order.
    pub field_order: FieldOrder,
    /// Bytes per line (stride). Zero for compressed formats on some drivers.
    pub stride: u32,
    /// Maximum image size in bytes.
    pub size: u32,
}

impl Format {
    /// Whether the driver honoured every field of `request`.
    #[must_use]
    pub fn matches(&self, request: &FormatRequest) -> bool {
        self.width == request.width
            && self.height == request.height
            && self.fourcc == request.fourcc
            && self.field_order == request.field_order
    }
}

/// Result of `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Kernel version the driver was built for, `KERNEL_VERSION` encoded.
    pub version: u32,
    /// Capabilities of the physical device.
    pub capabilities: u32,
}

impl Capability {
    /// `V4L2_CAP_VIDEO_CAPTURE`.
    pub const VIDEO_CAPTURE: u32 = 0x0000_0001;
    /// `V4L2_CAP_STREAMING`.
    pub const STREAMING: u32 = 0x0400_0000;

    /// Whether the device can capture video.
    #[must_use]
    pub const fn can_capture(&self) -> bool {
        self.capabilities & Self::VIDEO_CAPTURE != 0
    }

    /// Whether the device supports streaming I/O.
    #[must_use]
    pub const fn can_stream(&self) -> bool {
        self.capabilities & Self::STREAMING != 0
    }
}

/// Time per frame as reported by `VIDIOC_G_PARM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    /// Seconds numerator.
    pub numerator: u32,
    /// Frames denominator.
    pub denominator: u32,
    /// Whether the frame rate can be programmed (`V4L2_CAP_TIMEPERFRAME`).
    pub programmable: bool,
}

impl FrameInterval {
    /// Frames per second, if the interval is non-degenerate.
    #[must_use]
    pub fn fps(&self) -> Option<f64> {
        (self.numerator != 0).then(|| f64::from(self.denominator) / f64::from(self.numerator))
    }
}

/// Kernel-side description of one buffer, from `VIDIOC_QUERYBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Driver-assigned index.
    pub index: u32,
    /// Region length in bytes.
    pub length: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
}

/// Metadata the driver attaches to a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
    /// Raw `V4L2_BUF_FLAG_*` bits.
    pub flags: u32,
}

impl FrameMetadata {
    /// `V4L2_BUF_FLAG_ERROR`: the driver filled the buffer but the data may be corrupted.
    pub const FLAG_ERROR: u32 = v4l::buffer::Flags::ERROR.bits();

    /// Whether the driver flagged this frame as corrupted.
    pub const fn is_corrupted(&self) -> bool {
        self.flags & Self::FLAG_ERROR != 0
    }
}

/// A captured frame, borrowed from its mapped buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Valid payload, exactly `metadata.bytes_used` bytes.
    pub data: &'a [u8],
    /// Session sequence number, starting at 0.
    pub sequence: u32,
    /// Index of the buffer holding the payload.
    pub buffer_index: u32,
    /// Driver metadata.
    pub metadata: FrameMetadata,
}

/// Privileged control calls on an open video device.
///
/// Implementations perform the raw driver call and nothing else: no retries
/// and no ownership bookkeeping, which live in [`crate::pool::BufferPool`].
pub trait VideoDriver {
    /// A mapped buffer region. Dropping it unmaps the region.
    type Region: AsRef<[u8]>;

    /// `VIDIOC_QUERYCAP`.
    fn query_capability(&self) -> io::Result<Capability>;

    /// `VIDIOC_S_FMT`. Returns the format the driver actually set.
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<Format>;

    /// `VIDIOC_G_PARM`.
    fn frame_interval(&self) -> io::Result<FrameInterval>;

    /// `VIDIOC_REQBUFS` for memory-mapped capture. Returns the granted count.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// `VIDIOC_QUERYBUF`.
    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo>;

    /// Map a buffer read/write, shared with the driver.
    fn map_buffer(&mut self, info: &BufferInfo) -> io::Result<Self::Region>;

    /// `VIDIOC_QBUF`.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// `VIDIOC_DQBUF`. Blocks until a buffer is filled, or fails with
    /// [`io::ErrorKind::TimedOut`] once `timeout` elapses.
    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> io::Result<(u32, FrameMetadata)>;

    /// `VIDIOC_STREAMON`.
    fn stream_on(&mut self) -> io::Result<()>;

    /// `VIDIOC_STREAMOFF`. Returns every queued buffer to userspace.
    fn stream_off(&mut self) -> io::Result<()>;
}
