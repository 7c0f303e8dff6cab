//! Mock driver for testing without hardware.
//!
//! The mock behaves like a well-mannered V4L2 driver: it grants at most a
//! configured number of buffers, rejects double-queues, fills buffers in FIFO
//! order and returns them all on stream-off. Every buffer and stream call is
//! recorded in a shared [`EventLog`] so tests can check call order and
//! mapping lifetimes. Individual calls can be made to fail.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::traits::{
    BufferInfo, Capability, Format, FormatRequest, FrameInterval, FrameMetadata, VideoDriver,
};

/// Buffer and stream calls seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// `REQBUFS` with the requested count.
    RequestBuffers(u32),
    /// Buffer mapped.
    Map(u32),
    /// Buffer unmapped.
    Unmap(u32),
    /// `QBUF`.
    Queue(u32),
    /// `DQBUF` returned this buffer.
    Dequeue(u32),
    /// `STREAMON`.
    StreamOn,
    /// `STREAMOFF`.
    StreamOff,
}

/// Shared record of driver calls.
pub type EventLog = Rc<RefCell<Vec<DriverEvent>>>;

const PAGE_SIZE: u32 = 4096;

/// Region handed out by [`MockDriver::map_buffer`]. Logs its unmap on drop.
pub struct MockRegion {
    index: u32,
    data: Vec<u8>,
    log: EventLog,
}

impl AsRef<[u8]> for MockRegion {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        self.log.borrow_mut().push(DriverEvent::Unmap(self.index));
    }
}

#[derive(Debug, Default)]
struct Faults {
    capability: bool,
    format: bool,
    parameters: bool,
    stream_on: bool,
    stream_off: bool,
    overrun: bool,
    map_at: Option<u32>,
    queue_on_call: Option<(usize, i32)>,
    dequeue_after: Option<(usize, i32)>,
    error_frame: Option<usize>,
}

/// Mock device for testing without hardware.
pub struct MockDriver {
    capability: Capability,
    max_width: u32,
    max_height: u32,
    max_buffers: u32,
    payload_len: Option<u32>,
    image_size: u32,
    faults: Faults,
    granted: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    queue_calls: usize,
    dequeues: usize,
    log: EventLog,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a mock capture device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capability: Capability {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                version: 0x0006_0100,
                capabilities: Capability::VIDEO_CAPTURE | Capability::STREAMING,
            },
            max_width: 1920,
            max_height: 1080,
            max_buffers: 32,
            payload_len: None,
            image_size: 640 * 480 * 2,
            faults: Faults::default(),
            granted: 0,
            queued: VecDeque::new(),
            streaming: false,
            queue_calls: 0,
            dequeues: 0,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Clamp negotiated resolutions to this size.
    #[must_use]
    pub const fn with_max_resolution(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    /// Grant at most `count` buffers.
    #[must_use]
    pub const fn with_max_buffers(mut self, count: u32) -> Self {
        self.max_buffers = count;
        self
    }

    /// Report `len` bytes used for every frame.
    #[must_use]
    pub const fn with_payload_len(mut self, len: u32) -> Self {
        self.payload_len = Some(len);
        self
    }

    /// Override the reported capability bitmask.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: u32) -> Self {
        self.capability.capabilities = capabilities;
        self
    }

    /// Reject `QUERYCAP` like a non-V4L2 node would.
    #[must_use]
    pub const fn fail_capability(mut self) -> Self {
        self.faults.capability = true;
        self
    }

    /// Reject `S_FMT`.
    #[must_use]
    pub const fn fail_format(mut self) -> Self {
        self.faults.format = true;
        self
    }

    /// Reject `G_PARM`.
    #[must_use]
    pub const fn fail_parameters(mut self) -> Self {
        self.faults.parameters = true;
        self
    }

    /// Reject `STREAMON`.
    #[must_use]
    pub const fn fail_stream_on(mut self) -> Self {
        self.faults.stream_on = true;
        self
    }

    /// Reject `STREAMOFF`.
    #[must_use]
    pub const fn fail_stream_off(mut self) -> Self {
        self.faults.stream_off = true;
        self
    }

    /// Fail mapping buffer `index`.
    #[must_use]
    pub const fn fail_map_at(mut self, index: u32) -> Self {
        self.faults.map_at = Some(index);
        self
    }

    /// Fail the `call`-th `QBUF` (1-based) with `EIO`.
    #[must_use]
    pub const fn fail_queue_on_call(self, call: usize) -> Self {
        self.fail_queue_with(call, libc::EIO)
    }

    /// Fail the `call`-th `QBUF` (1-based) with `errno`.
    #[must_use]
    pub const fn fail_queue_with(mut self, call: usize, errno: i32) -> Self {
        self.faults.queue_on_call = Some((call, errno));
        self
    }

    /// Flag the `frame`-th dequeued buffer (0-based) with `V4L2_BUF_FLAG_ERROR`.
    #[must_use]
    pub const fn flag_error_on_frame(mut self, frame: usize) -> Self {
        self.faults.error_frame = Some(frame);
        self
    }

    /// Fail every `DQBUF` after `count` successful ones with `errno`.
    #[must_use]
    pub const fn fail_dequeue_after(mut self, count: usize, errno: i32) -> Self {
        self.faults.dequeue_after = Some((count, errno));
        self
    }

    /// Report more bytes used than the buffer holds.
    #[must_use]
    pub const fn report_overrun(mut self) -> Self {
        self.faults.overrun = true;
        self
    }

    /// Handle on the call log.
    pub fn log(&self) -> EventLog {
        Rc::clone(&self.log)
    }

    /// Number of regions mapped and not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.log.borrow().iter().fold(0usize, |live, event| match event {
            DriverEvent::Map(_) => live + 1,
            DriverEvent::Unmap(_) => live.saturating_sub(1),
            _ => live,
        })
    }

    /// Whether `STREAMON` is in effect.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    const fn buffer_len(&self, index: u32) -> u32 {
        self.image_size + index * PAGE_SIZE
    }

    fn frame_len(&self, index: u32) -> u32 {
        self.payload_len
            .unwrap_or_else(|| self.buffer_len(index) / 8 + index * 16)
            .min(self.buffer_len(index))
    }

    fn record(&self, event: DriverEvent) {
        self.log.borrow_mut().push(event);
    }

    fn einval() -> io::Error {
        io::Error::from_raw_os_error(libc::EINVAL)
    }
}

/// A fake motion-JPEG frame: SOI, filler, EOI.
fn fake_jpeg(region: &mut [u8], frame_len: usize, seed: u32) {
    let fill = seed.to_le_bytes()[0];
    for byte in region.iter_mut().take(frame_len) {
        *byte = fill;
    }
    if frame_len >= 4 {
        region[..2].copy_from_slice(&[0xFF, 0xD8]);
        region[frame_len - 2..frame_len].copy_from_slice(&[0xFF, 0xD9]);
    }
}

impl VideoDriver for MockDriver {
    type Region = MockRegion;

    fn query_capability(&self) -> io::Result<Capability> {
        if self.faults.capability {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        Ok(self.capability.clone())
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<Format> {
        if self.faults.format {
            return Err(Self::einval());
        }

        let width = request.width.clamp(16, self.max_width);
        let height = request.height.clamp(16, self.max_height);
        self.image_size = width * height * 2;

        Ok(Format {
            width,
            height,
            fourcc: request.fourcc,
            field_order: request.field_order,
            stride: 0,
            size: self.image_size,
        })
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        if self.faults.parameters {
            return Err(Self::einval());
        }
        Ok(FrameInterval {
            numerator: 1,
            denominator: 30,
            programmable: true,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.record(DriverEvent::RequestBuffers(count));
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.granted = count.min(self.max_buffers);
        Ok(self.granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        if index >= self.granted {
            return Err(Self::einval());
        }
        Ok(BufferInfo {
            index,
            length: self.buffer_len(index),
            offset: index * 0x0010_0000,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> io::Result<MockRegion> {
        if self.faults.map_at == Some(info.index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let mut data = vec![0u8; info.length as usize];
        fake_jpeg(&mut data, self.frame_len(info.index) as usize, info.index);
        self.record(DriverEvent::Map(info.index));

        Ok(MockRegion {
            index: info.index,
            data,
            log: self.log(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        self.queue_calls += 1;
        if let Some((call, errno)) = self.faults.queue_on_call {
            if call == self.queue_calls {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        if index >= self.granted || self.queued.contains(&index) {
            return Err(Self::einval());
        }
        self.queued.push_back(index);
        self.record(DriverEvent::Queue(index));
        Ok(())
    }

    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> io::Result<(u32, FrameMetadata)> {
        if !self.streaming {
            return Err(Self::einval());
        }
        if let Some((count, errno)) = self.faults.dequeue_after {
            if self.dequeues >= count {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }

        let Some(index) = self.queued.pop_front() else {
            return Err(match timeout {
                Some(_) => io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"),
                None => io::Error::from_raw_os_error(libc::EAGAIN),
            });
        };

        let sequence = u32::try_from(self.dequeues).unwrap_or(u32::MAX);
        self.dequeues += 1;
        self.record(DriverEvent::Dequeue(index));

        let corrupted = self.faults.error_frame == Some(self.dequeues - 1);
        let bytes_used = if self.faults.overrun {
            self.buffer_len(index) + 1
        } else if corrupted {
            0
        } else {
            self.frame_len(index)
        };
        let flags = if corrupted { FrameMetadata::FLAG_ERROR } else { 0 };

        Ok((
            index,
            FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
                bytes_used,
                flags,
            },
        ))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.faults.stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = true;
        self.record(DriverEvent::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        if self.faults.stream_off {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = false;
        self.queued.clear();
        self.record(DriverEvent::StreamOff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FourCC;

    #[test]
    fn test_mock_driver_defaults() {
        let driver = MockDriver::new();
        let caps = driver.query_capability().expect("caps");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture());
        assert!(caps.can_stream());
        assert!(!driver.is_streaming());
    }

    #[test]
    fn test_mock_driver_clamps_format() {
        let mut driver = MockDriver::new().with_max_resolution(640, 480);
        let format = driver
            .set_format(&FormatRequest::new(1280, 720, FourCC::MJPG))
            .expect("format");
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!(format.size, 640 * 480 * 2);
    }

    #[test]
    fn test_mock_driver_rejects_double_queue() {
        let mut driver = MockDriver::new();
        driver.request_buffers(2).expect("reqbufs");
        driver.queue_buffer(0).expect("first queue");
        let err = driver.queue_buffer(0).expect_err("double queue");
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_mock_driver_fifo_and_stream_off() {
        let mut driver = MockDriver::new();
        driver.request_buffers(3).expect("reqbufs");
        for index in 0..3 {
            driver.queue_buffer(index).expect("queue");
        }
        driver.stream_on().expect("stream on");

        let (first, meta) = driver.dequeue_buffer(None).expect("dequeue");
        assert_eq!(first, 0);
        assert_eq!(meta.sequence, 0);
        let (second, meta) = driver.dequeue_buffer(None).expect("dequeue");
        assert_eq!(second, 1);
        assert_eq!(meta.sequence, 1);

        driver.stream_off().expect("stream off");
        assert!(driver.dequeue_buffer(None).is_err());
    }

    #[test]
    fn test_mock_region_carries_fake_jpeg() {
        let mut driver = MockDriver::new().with_payload_len(64);
        driver.request_buffers(1).expect("reqbufs");
        let info = driver.query_buffer(0).expect("querybuf");
        let region = driver.map_buffer(&info).expect("map");

        let data = region.as_ref();
        assert_eq!(data.len(), info.length as usize);
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(&data[62..64], &[0xFF, 0xD9]);

        drop(region);
        assert_eq!(driver.live_mappings(), 0);
        assert_eq!(
            *driver.log().borrow(),
            vec![
                DriverEvent::RequestBuffers(1),
                DriverEvent::Map(0),
                DriverEvent::Unmap(0)
            ]
        );
    }
}
