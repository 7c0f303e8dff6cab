//! Pool of driver buffers mapped into the process.
//!
//! Every buffer carries an explicit [`BufferState`]. Ownership alternates
//! between userspace and the driver:
//!
//! ```text
//!   Free --enqueue--> Queued --dequeue--> Filled --enqueue--> Queued ...
//!                        \                  /
//!                         +---reclaim_all--+--> Free   (after STREAMOFF)
//! ```
//!
//! The state is checked before every driver call and before every read, so a
//! double-queue or a read of a driver-owned buffer is reported as an error
//! instead of corrupting shared memory.

use std::io;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::device::DeviceHandle;
use crate::error::{CameraError, Result};
use crate::traits::{FrameMetadata, VideoDriver};

/// Ownership state of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by userspace, holds no valid payload.
    Free,
    /// Owned by the driver, awaiting fill.
    Queued,
    /// Owned by userspace, the first `bytes_used` bytes are a valid frame.
    Filled {
        /// Valid payload length, never more than the region length.
        bytes_used: usize,
    },
}

/// One driver buffer mapped into the process.
pub struct MappedBuffer<R> {
    index: u32,
    offset: u32,
    length: usize,
    state: BufferState,
    region: R,
}

impl<R: AsRef<[u8]>> MappedBuffer<R> {
    /// Driver-assigned index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Kernel offset the region was mapped from.
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Region length in bytes, as queried from the driver.
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Whether the region is zero-length.
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current ownership state.
    pub const fn state(&self) -> BufferState {
        self.state
    }
}

/// Fixed set of memory-mapped capture buffers.
///
/// The buffer count is whatever the driver granted in [`Self::allocate`] and
/// never changes afterwards. Regions are unmapped by [`Self::release_all`],
/// which also runs on drop.
pub struct BufferPool<R: AsRef<[u8]>> {
    requested: u32,
    granted: u32,
    buffers: Vec<MappedBuffer<R>>,
}

impl<R: AsRef<[u8]>> BufferPool<R> {
    /// Ask the driver for `requested` memory-mapped capture buffers.
    ///
    /// The driver may grant fewer; [`Self::len`] reports the granted count.
    pub fn allocate<D>(handle: &mut DeviceHandle<D>, requested: u32) -> Result<Self>
    where
        D: VideoDriver<Region = R>,
    {
        if handle.format().is_none() {
            return Err(CameraError::InvalidState {
                operation: "allocate buffers",
                reason: "format not negotiated",
            });
        }
        if requested == 0 {
            return Err(CameraError::Allocation {
                requested,
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero buffers requested"),
            });
        }

        let granted = handle
            .driver_mut()
            .request_buffers(requested)
            .map_err(|source| CameraError::Allocation { requested, source })?;

        if granted == 0 {
            return Err(CameraError::Allocation {
                requested,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "driver granted no buffers"),
            });
        }
        if granted < requested {
            warn!(requested, granted, "driver granted fewer buffers than requested");
        } else {
            debug!(granted, "buffers allocated");
        }

        Ok(Self {
            requested,
            granted,
            buffers: Vec::with_capacity(usize::try_from(granted).unwrap_or_default()),
        })
    }

    /// Map every granted buffer into the process.
    ///
    /// If any buffer fails, the ones already mapped are unmapped before the
    /// error is returned.
    pub fn map_all<D>(&mut self, handle: &mut DeviceHandle<D>) -> Result<()>
    where
        D: VideoDriver<Region = R>,
    {
        if !self.buffers.is_empty() {
            return Err(CameraError::InvalidState {
                operation: "map buffers",
                reason: "pool is already mapped",
            });
        }

        for index in 0..self.granted {
            match Self::map_one(handle, index) {
                Ok(buffer) => {
                    debug!(
                        index,
                        offset = buffer.offset,
                        length = buffer.length,
                        "buffer mapped"
                    );
                    self.buffers.push(buffer);
                }
                Err(err) => {
                    let released = self.release_all();
                    warn!(index, released, "mapping failed, released mapped buffers");
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    fn map_one<D>(handle: &mut DeviceHandle<D>, index: u32) -> Result<MappedBuffer<R>>
    where
        D: VideoDriver<Region = R>,
    {
        let info = handle
            .driver()
            .query_buffer(index)
            .map_err(|source| CameraError::Mapping { index, source })?;
        let region = handle
            .driver_mut()
            .map_buffer(&info)
            .map_err(|source| CameraError::Mapping { index, source })?;

        Ok(MappedBuffer {
            index,
            offset: info.offset,
            length: region.as_ref().len(),
            state: BufferState::Free,
            region,
        })
    }

    /// Hand buffer `index` to the driver for filling.
    ///
    /// Only Free or Filled buffers may be queued. On driver failure the
    /// buffer keeps its previous state.
    pub fn enqueue<D>(&mut self, handle: &mut DeviceHandle<D>, index: u32) -> Result<()>
    where
        D: VideoDriver<Region = R>,
    {
        let buffer = self.buffer_mut(index)?;
        if buffer.state == BufferState::Queued {
            return Err(CameraError::BufferState {
                index,
                operation: "enqueue",
                actual: buffer.state,
            });
        }

        handle
            .driver_mut()
            .queue_buffer(index)
            .map_err(|source| CameraError::Enqueue { index, source })?;

        buffer.state = BufferState::Queued;
        trace!(index, "buffer queued");
        Ok(())
    }

    /// Wait for the driver to fill a buffer and take it back.
    ///
    /// Blocks until a buffer is ready, or at most `timeout` when given.
    pub fn dequeue<D>(
        &mut self,
        handle: &mut DeviceHandle<D>,
        timeout: Option<Duration>,
    ) -> Result<(u32, FrameMetadata)>
    where
        D: VideoDriver<Region = R>,
    {
        let (index, metadata) =
            handle
                .driver_mut()
                .dequeue_buffer(timeout)
                .map_err(|source| match timeout {
                    Some(limit) if source.kind() == io::ErrorKind::TimedOut => {
                        CameraError::Timeout(limit)
                    }
                    _ => CameraError::Dequeue(source),
                })?;

        let buffer = self.buffer_mut(index)?;
        if buffer.state != BufferState::Queued {
            return Err(CameraError::BufferState {
                index,
                operation: "dequeue",
                actual: buffer.state,
            });
        }

        let bytes_used = usize::try_from(metadata.bytes_used).unwrap_or(usize::MAX);
        if bytes_used > buffer.length {
            buffer.state = BufferState::Filled { bytes_used: 0 };
            return Err(CameraError::PayloadOverrun {
                index,
                bytes_used: metadata.bytes_used,
                length: buffer.length,
            });
        }

        buffer.state = BufferState::Filled { bytes_used };
        trace!(index, bytes_used, "buffer dequeued");
        Ok((index, metadata))
    }

    /// Valid payload of a Filled buffer.
    pub fn payload(&self, index: u32) -> Result<&[u8]> {
        let buffer = self.buffer(index)?;
        let BufferState::Filled { bytes_used } = buffer.state else {
            return Err(CameraError::BufferState {
                index,
                operation: "read",
                actual: buffer.state,
            });
        };

        buffer
            .region
            .as_ref()
            .get(..bytes_used)
            .ok_or(CameraError::PayloadOverrun {
                index,
                bytes_used: u32::try_from(bytes_used).unwrap_or(u32::MAX),
                length: buffer.length,
            })
    }

    /// Mark every buffer Free after the driver returned them on stream-off.
    pub fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.state = BufferState::Free;
        }
    }

    /// Unmap every mapped region and return how many were unmapped.
    ///
    /// Safe to call repeatedly and on a partially mapped pool. Streaming must
    /// be stopped first; buffers still queued are reported as a contract
    /// violation.
    pub fn release_all(&mut self) -> usize {
        let still_queued: Vec<u32> = self
            .buffers
            .iter()
            .filter(|buffer| buffer.state == BufferState::Queued)
            .map(|buffer| buffer.index)
            .collect();
        if !still_queued.is_empty() {
            error!(
                indices = ?still_queued,
                "unmapping buffers still owned by the driver, stream-off was skipped"
            );
        }

        let released = self.buffers.len();
        self.buffers.clear();
        if released > 0 {
            debug!(released, "buffers unmapped");
        }
        released
    }

    /// Number of buffers granted by the driver.
    pub fn len(&self) -> usize {
        usize::try_from(self.granted).unwrap_or_default()
    }

    /// Whether the pool holds no buffers. Never true after `allocate`.
    pub const fn is_empty(&self) -> bool {
        self.granted == 0
    }

    /// Number of buffers originally requested.
    pub const fn requested(&self) -> u32 {
        self.requested
    }

    /// Number of regions currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.buffers.len()
    }

    /// Whether every granted buffer is mapped.
    pub fn is_mapped(&self) -> bool {
        !self.buffers.is_empty() && self.buffers.len() == self.len()
    }

    /// State of buffer `index`, if mapped.
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffer(index).ok().map(MappedBuffer::state)
    }

    /// Mapped buffers in index order.
    pub fn buffers(&self) -> impl Iterator<Item = &MappedBuffer<R>> {
        self.buffers.iter()
    }

    fn buffer(&self, index: u32) -> Result<&MappedBuffer<R>> {
        let count = self.buffers.len();
        usize::try_from(index)
            .ok()
            .and_then(|i| self.buffers.get(i))
            .ok_or(CameraError::InvalidIndex { index, count })
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut MappedBuffer<R>> {
        let count = self.buffers.len();
        usize::try_from(index)
            .ok()
            .and_then(|i| self.buffers.get_mut(i))
            .ok_or(CameraError::InvalidIndex { index, count })
    }
}

impl<R: AsRef<[u8]>> Drop for BufferPool<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}
