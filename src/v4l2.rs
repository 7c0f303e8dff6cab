//! Kernel V4L2 driver built on the `v4l` crate.
//!
//! Capability, format and parameter calls go through `v4l::Device`. The
//! buffer calls (`REQBUFS`, `QUERYBUF`, `QBUF`, `DQBUF`, `STREAMON`,
//! `STREAMOFF`) are issued directly through `v4l::v4l2::ioctl` so that buffer
//! ownership stays with [`crate::pool::BufferPool`] instead of `v4l`'s own
//! stream type. Regions are mapped with `memmap2` and unmapped on drop.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::trace;
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    BufferInfo, Capability, FieldOrder, Format, FormatRequest, FourCC, FrameInterval,
    FrameMetadata, VideoDriver,
};

/// Driver for a real `/dev/video*` node.
pub struct V4L2Driver {
    device: Device,
}

impl V4L2Driver {
    /// Open the device node at `path` read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        Ok(Self { device })
    }

    fn fd(&self) -> std::os::raw::c_int {
        self.device.handle().fd()
    }

    fn mmap_buffer(index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct for which all-zero is valid.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf
    }

    /// Block until a filled buffer is ready, or `timeout` expires.
    ///
    /// The node is opened non-blocking, so `DQBUF` alone would fail with
    /// `EAGAIN` whenever no frame is ready yet.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<()> {
        let millis = poll_timeout(timeout);
        loop {
            match self.device.handle().poll(libc::POLLIN, millis) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF")),
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// `poll` timeout in milliseconds; `-1` waits indefinitely.
fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    timeout.map_or(-1, |limit| {
        libc::c_int::try_from(limit.as_millis()).unwrap_or(libc::c_int::MAX)
    })
}

const fn field_to_v4l(field: FieldOrder) -> v4l::format::FieldOrder {
    use v4l::format::FieldOrder as V4lField;

    match field {
        FieldOrder::Any => V4lField::Any,
        FieldOrder::Progressive => V4lField::Progressive,
        FieldOrder::Top => V4lField::Top,
        FieldOrder::Bottom => V4lField::Bottom,
        FieldOrder::Interlaced => V4lField::Interlaced,
        FieldOrder::SequentialTb => V4lField::SequentialTB,
        FieldOrder::SequentialBt => V4lField::SequentialBT,
        FieldOrder::Alternate => V4lField::Alternate,
        FieldOrder::InterlacedTb => V4lField::InterlacedTB,
        FieldOrder::InterlacedBt => V4lField::InterlacedBT,
    }
}

impl VideoDriver for V4L2Driver {
    type Region = MmapMut;

    fn query_capability(&self) -> io::Result<Capability> {
        let caps = self.device.query_caps()?;
        let (major, minor, patch) = caps.version;

        Ok(Capability {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            version: (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch),
            capabilities: caps.capabilities.bits(),
        })
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<Format> {
        let mut fmt = self.device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = request.fourcc.into();
        fmt.field_order = field_to_v4l(request.field_order);

        let fmt = self.device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            field_order: FieldOrder::from_raw(fmt.field_order as u32).unwrap_or(FieldOrder::Any),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        let params = self.device.params()?;

        Ok(FrameInterval {
            numerator: params.interval.numerator,
            denominator: params.interval.denominator,
            programmable: params
                .capabilities
                .contains(v4l::parameters::Capabilities::TIME_PER_FRAME),
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: all-zero is a valid v4l2_requestbuffers.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;

        // SAFETY: REQBUFS takes a pointer to v4l2_requestbuffers, which outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast(),
            )?;
        }
        trace!(requested = count, granted = req.count, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut buf = Self::mmap_buffer(index);

        // SAFETY: QUERYBUF takes a pointer to v4l2_buffer, which outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast(),
            )?;
        }

        Ok(BufferInfo {
            index,
            length: buf.length,
            // SAFETY: for MMAP buffers the driver fills the `offset` member.
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> io::Result<MmapMut> {
        let len = usize::try_from(info.length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "buffer length overflow"))?;

        // SAFETY: the region belongs to the driver's buffer `info.index`; the
        // pool only reads it while it owns that buffer.
        unsafe {
            MmapOptions::new()
                .offset(u64::from(info.offset))
                .len(len)
                .map_mut(self.fd())
        }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::mmap_buffer(index);

        // SAFETY: QBUF takes a pointer to v4l2_buffer, which outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast(),
            )
        }
    }

    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> io::Result<(u32, FrameMetadata)> {
        self.wait_readable(timeout)?;

        let mut buf = Self::mmap_buffer(0);

        // SAFETY: DQBUF takes a pointer to v4l2_buffer, which outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast(),
            )?;
        }

        let secs = u64::try_from(buf.timestamp.tv_sec).unwrap_or(0);
        let micros = u32::try_from(buf.timestamp.tv_usec).unwrap_or(0);

        Ok((
            buf.index,
            FrameMetadata {
                sequence: buf.sequence,
                timestamp: Duration::new(secs, micros.saturating_mul(1000)),
                bytes_used: buf.bytesused,
                flags: buf.flags,
            },
        ))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;

        // SAFETY: STREAMON takes a pointer to the buffer type.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMON,
                ptr::addr_of_mut!(typ).cast(),
            )
        }
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;

        // SAFETY: STREAMOFF takes a pointer to the buffer type.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                ptr::addr_of_mut!(typ).cast(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_blocks_without_limit() {
        assert_eq!(poll_timeout(None), -1);
    }

    #[test]
    fn test_poll_timeout_millis() {
        assert_eq!(poll_timeout(Some(Duration::from_secs(2))), 2000);
        assert_eq!(poll_timeout(Some(Duration::from_micros(1500))), 1);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), 0);
        assert_eq!(
            poll_timeout(Some(Duration::from_secs(u64::MAX))),
            libc::c_int::MAX
        );
    }
}
