//! Device handle: the open driver plus the format negotiated on it.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::traits::{Capability, Format, FormatRequest, FrameInterval, VideoDriver};
use crate::v4l2::V4L2Driver;

/// An open video device.
///
/// Buffer and streaming operations borrow the handle mutably, so it cannot be
/// closed while a [`crate::session::CaptureSession`] is alive.
pub struct DeviceHandle<D: VideoDriver> {
    driver: D,
    path: PathBuf,
    format: Option<Format>,
    interval: Option<FrameInterval>,
}

impl DeviceHandle<V4L2Driver> {
    /// Open a V4L2 device node (e.g. `/dev/video0`) for read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let driver = V4L2Driver::open(path).map_err(|source| CameraError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "opened device");
        Ok(Self::with_driver(driver, path))
    }
}

impl<D: VideoDriver> DeviceHandle<D> {
    /// Wrap an already-open driver.
    pub fn with_driver<P: AsRef<Path>>(driver: D, path: P) -> Self {
        Self {
            driver,
            path: path.as_ref().to_path_buf(),
            format: None,
            interval: None,
        }
    }

    /// Device path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Query driver identity and capabilities.
    pub fn query_capability(&self) -> Result<Capability> {
        self.driver.query_capability().map_err(CameraError::Query)
    }

    /// Request a capture format and return what the driver actually set.
    ///
    /// The driver may adjust width, height, stride and image size to what the
    /// hardware supports; callers must use the returned format.
    pub fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format> {
        let format = self
            .driver
            .set_format(request)
            .map_err(CameraError::Format)?;

        if format.matches(request) {
            info!(
                width = format.width,
                height = format.height,
                fourcc = %format.fourcc,
                field = ?format.field_order,
                size = format.size,
                "format negotiated"
            );
        } else {
            warn!(
                requested = ?request,
                actual = ?format,
                "driver adjusted the requested format"
            );
        }

        self.format = Some(format.clone());
        Ok(format)
    }

    /// Query the current frame interval.
    ///
    /// Failure is not fatal: capture can proceed with the device defaults.
    pub fn query_frame_interval(&mut self) -> Result<FrameInterval> {
        let interval = self
            .driver
            .frame_interval()
            .map_err(CameraError::ParameterQuery)?;
        self.interval = Some(interval);
        Ok(interval)
    }

    /// Format negotiated by the last successful [`Self::negotiate_format`].
    pub const fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Frame interval from the last successful [`Self::query_frame_interval`].
    pub const fn frame_interval(&self) -> Option<FrameInterval> {
        self.interval
    }

    pub(crate) fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Close the device.
    pub fn close(self) {
        debug!(path = %self.path.display(), "closing device");
    }
}
