//! Capture session: the streaming state machine.
//!
//! ```text
//!   Idle --start()--> Streaming --stop()--> Idle
//!                         |
//!                  capture_next(): dequeue -> sink -> re-enqueue
//! ```
//!
//! A session borrows the device handle and the buffer pool for its whole
//! lifetime, so neither can be closed or unmapped while it streams. Dropping
//! a session that is still streaming issues stream-off first.

use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::config::CaptureConfig;
use crate::device::DeviceHandle;
use crate::error::{CameraError, Result};
use crate::pool::{BufferPool, BufferState};
use crate::sink::FrameSink;
use crate::traits::{Capability, Format, Frame, FrameInterval, VideoDriver};

/// Streaming state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not streaming; buffers are userspace-owned.
    Idle,
    /// `STREAMON` issued; buffers cycle through the driver.
    Streaming,
}

/// Outcome of one [`CaptureSession::capture_next`] call.
#[derive(Debug)]
pub struct CaptureReport {
    /// Session sequence number of the frame.
    pub sequence: u32,
    /// Buffer the frame was delivered in.
    pub buffer_index: u32,
    /// Valid payload length.
    pub bytes_used: usize,
    /// Length of the buffer's mapped region.
    pub buffer_len: usize,
    /// Set when the sink failed to persist the frame.
    pub sink_error: Option<CameraError>,
}

impl CaptureReport {
    /// Whether the sink persisted the frame.
    pub const fn persisted(&self) -> bool {
        self.sink_error.is_none()
    }
}

/// Drives one device and its buffer pool through a streaming run.
pub struct CaptureSession<'a, D: VideoDriver> {
    handle: &'a mut DeviceHandle<D>,
    pool: &'a mut BufferPool<D::Region>,
    state: SessionState,
    frames_captured: u32,
    frames_dropped: u32,
    frames_discarded: u32,
    timeout: Option<Duration>,
}

impl<'a, D: VideoDriver> CaptureSession<'a, D> {
    /// Create an idle session over a negotiated device and a mapped pool.
    pub fn new(handle: &'a mut DeviceHandle<D>, pool: &'a mut BufferPool<D::Region>) -> Result<Self> {
        if handle.format().is_none() {
            return Err(CameraError::InvalidState {
                operation: "create capture session",
                reason: "format not negotiated",
            });
        }
        if !pool.is_mapped() {
            return Err(CameraError::InvalidState {
                operation: "create capture session",
                reason: "buffer pool is not mapped",
            });
        }

        Ok(Self {
            handle,
            pool,
            state: SessionState::Idle,
            frames_captured: 0,
            frames_dropped: 0,
            frames_discarded: 0,
            timeout: None,
        })
    }

    /// Bound each dequeue wait by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Queue every buffer and start streaming.
    ///
    /// If stream-on is rejected the buffers stay queued; dropping the session
    /// issues stream-off and reclaims them.
    pub fn start(&mut self) -> Result<()> {
        if self.state == SessionState::Streaming {
            return Err(CameraError::InvalidState {
                operation: "start streaming",
                reason: "session is already streaming",
            });
        }

        let indices: Vec<u32> = self.pool.buffers().map(|buffer| buffer.index()).collect();
        for index in indices {
            self.pool.enqueue(self.handle, index)?;
        }

        self.handle
            .driver_mut()
            .stream_on()
            .map_err(CameraError::StreamStart)?;

        self.state = SessionState::Streaming;
        info!(buffers = self.pool.len(), "streaming started");
        Ok(())
    }

    /// Capture one frame and hand it to `sink`.
    ///
    /// The buffer is re-queued after the sink returns, whether or not the sink
    /// succeeded. Sink failures are logged and reported in the returned
    /// [`CaptureReport`]; dequeue and enqueue failures are returned as
    /// [`CameraError::Capture`].
    ///
    /// A sequence number is spent once the sink has seen it, so a failed
    /// re-queue never repeats it. The buffer left behind stays Filled and is
    /// re-queued at the start of the next call. Frames the driver flags as
    /// corrupted are re-queued without reaching the sink.
    pub fn capture_next<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<CaptureReport> {
        if self.state != SessionState::Streaming {
            return Err(CameraError::InvalidState {
                operation: "capture a frame",
                reason: "session is not streaming",
            });
        }

        let sequence = self.frames_captured;
        let wrap = |source: CameraError| CameraError::Capture {
            sequence,
            source: Box::new(source),
        };

        self.requeue_stranded().map_err(wrap)?;

        let (index, metadata) = loop {
            match self.pool.dequeue(self.handle, self.timeout) {
                Ok((index, metadata)) if metadata.is_corrupted() => {
                    self.frames_discarded += 1;
                    warn!(
                        index,
                        driver_sequence = metadata.sequence,
                        "driver flagged frame as corrupted, discarded"
                    );
                    self.pool.enqueue(self.handle, index).map_err(wrap)?;
                }
                Ok(dequeued) => break dequeued,
                Err(CameraError::PayloadOverrun {
                    index,
                    bytes_used,
                    length,
                }) => {
                    // The driver handed the buffer back; give it to the driver again
                    // so the queue does not shrink.
                    self.pool.enqueue(self.handle, index).map_err(wrap)?;
                    return Err(wrap(CameraError::PayloadOverrun {
                        index,
                        bytes_used,
                        length,
                    }));
                }
                Err(err) => return Err(wrap(err)),
            }
        };

        let (bytes_used, buffer_len, sink_result) = {
            let data = self.pool.payload(index).map_err(wrap)?;
            let buffer_len = self
                .pool
                .buffers()
                .find(|buffer| buffer.index() == index)
                .map_or(data.len(), |buffer| buffer.len());
            let frame = Frame {
                data,
                sequence,
                buffer_index: index,
                metadata,
            };
            (data.len(), buffer_len, sink.write_frame(&frame))
        };
        self.frames_captured += 1;

        let sink_error = match sink_result {
            Ok(()) => {
                debug!(sequence, index, bytes_used, "frame captured");
                None
            }
            Err(source) => {
                self.frames_dropped += 1;
                warn!(sequence, index, %source, "frame lost, capture continues");
                Some(CameraError::SinkWrite { sequence, source })
            }
        };

        self.pool.enqueue(self.handle, index).map_err(wrap)?;

        Ok(CaptureReport {
            sequence,
            buffer_index: index,
            bytes_used,
            buffer_len,
            sink_error,
        })
    }

    /// Re-queue buffers left Filled by an earlier failed re-queue.
    fn requeue_stranded(&mut self) -> Result<()> {
        let stranded: Vec<u32> = self
            .pool
            .buffers()
            .filter(|buffer| matches!(buffer.state(), BufferState::Filled { .. }))
            .map(|buffer| buffer.index())
            .collect();
        for index in stranded {
            self.pool.enqueue(self.handle, index)?;
            debug!(index, "stranded buffer re-queued");
        }
        Ok(())
    }

    /// Stop streaming and take every buffer back from the driver.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Err(CameraError::InvalidState {
                operation: "stop streaming",
                reason: "session is not streaming",
            });
        }

        self.handle
            .driver_mut()
            .stream_off()
            .map_err(CameraError::StreamStop)?;
        self.pool.reclaim_all();
        self.state = SessionState::Idle;

        info!(
            captured = self.frames_captured,
            dropped = self.frames_dropped,
            "streaming stopped"
        );
        Ok(())
    }

    /// Current streaming state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Frames handed to the sink so far.
    pub const fn frames_captured(&self) -> u32 {
        self.frames_captured
    }

    /// Frames the sink failed to persist.
    pub const fn frames_dropped(&self) -> u32 {
        self.frames_dropped
    }

    /// Frames the driver flagged as corrupted, never handed to the sink.
    pub const fn frames_discarded(&self) -> u32 {
        self.frames_discarded
    }

    fn holds_driver_buffers(&self) -> bool {
        self.pool
            .buffers()
            .any(|buffer| buffer.state() == BufferState::Queued)
    }
}

impl<D: VideoDriver> Drop for CaptureSession<'_, D> {
    fn drop(&mut self) {
        if self.state != SessionState::Streaming && !self.holds_driver_buffers() {
            return;
        }
        match self.handle.driver_mut().stream_off() {
            Ok(()) => {
                self.pool.reclaim_all();
                self.state = SessionState::Idle;
                debug!("stream-off issued on session drop");
            }
            Err(err) => error!(%err, "stream-off on session drop failed"),
        }
    }
}

/// Summary of a [`capture_frames`] run.
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    /// Capabilities reported by the device.
    pub capability: Capability,
    /// Format the driver settled on.
    pub format: Format,
    /// Frame interval, if the device reports one.
    pub frame_interval: Option<FrameInterval>,
    /// Buffers granted by the driver.
    pub buffer_count: usize,
    /// Frames captured.
    pub frames_captured: u32,
    /// Frames the sink failed to persist.
    pub frames_dropped: u32,
    /// Frames the driver flagged as corrupted.
    pub frames_discarded: u32,
}

/// Run a complete bounded capture on an open device.
///
/// Queries capabilities, negotiates the configured format, maps the buffer
/// pool, captures `config.frame_limit` frames into `sink`, stops streaming
/// and unmaps every buffer. Any error aborts the run; resources acquired so
/// far are released before it is returned. The handle stays open for the
/// caller to close.
pub fn capture_frames<D, S>(
    handle: &mut DeviceHandle<D>,
    config: &CaptureConfig,
    sink: &mut S,
) -> Result<CaptureSummary>
where
    D: VideoDriver,
    S: FrameSink + ?Sized,
{
    let span = info_span!("capture", device = %handle.path().display());
    let _guard = span.enter();

    let capability = handle.query_capability()?;
    info!(
        driver = %capability.driver,
        card = %capability.card,
        bus = %capability.bus_info,
        version = %format_args!("{:08X}", capability.version),
        capabilities = %format_args!("{:08X}", capability.capabilities),
        "device opened"
    );
    if !capability.can_capture() || !capability.can_stream() {
        return Err(CameraError::NotCaptureDevice {
            card: capability.card,
            capabilities: capability.capabilities,
        });
    }

    let format = handle.negotiate_format(&config.format_request()?)?;

    let frame_interval = match handle.query_frame_interval() {
        Ok(interval) => {
            info!(
                numerator = interval.numerator,
                denominator = interval.denominator,
                fps = interval.fps(),
                programmable = interval.programmable,
                "frame interval"
            );
            Some(interval)
        }
        Err(err) => {
            warn!(%err, "frame interval unavailable, using device defaults");
            None
        }
    };

    let mut pool = BufferPool::allocate(handle, config.buffer_count)?;
    pool.map_all(handle)?;
    let buffer_count = pool.len();

    let (frames_captured, frames_dropped, frames_discarded) = {
        let mut session =
            CaptureSession::new(handle, &mut pool)?.with_timeout(config.dequeue_timeout());
        session.start()?;

        for _ in 0..config.frame_limit {
            session.capture_next(sink)?;
        }

        session.stop()?;
        (
            session.frames_captured(),
            session.frames_dropped(),
            session.frames_discarded(),
        )
    };

    pool.release_all();

    Ok(CaptureSummary {
        capability,
        format,
        frame_interval,
        buffer_count,
        frames_captured,
        frames_dropped,
        frames_discarded,
    })
}
