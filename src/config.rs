//! Capture configuration.
//!
//! Configuration is layered with figment:
//! 1. Built-in defaults (1280x720 MJPG, interlaced, 4 buffers, 5 frames)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `MMAP_CAM_` (e.g. `MMAP_CAM_FRAME_LIMIT=10`)
//!
//! The binary applies command-line overrides on top.
//!
//! # Example
//! ```no_run
//! use mmap_cam_capture::config::CaptureConfig;
//!
//! let config = CaptureConfig::load(Some(std::path::Path::new("capture.toml")))?;
//! println!("Capturing {} frames from {}", config.frame_limit, config.device.display());
//! # Ok::<(), mmap_cam_capture::CameraError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format as _, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CameraError, Result};
use crate::traits::{FieldOrder, FormatRequest, FourCC};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "MMAP_CAM_";

/// Settings for one capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture device node.
    pub device: PathBuf,
    /// Requested frame width in pixels.
    pub width: u32,
    /// Requested frame height in pixels.
    pub height: u32,
    /// Requested pixel format as a fourcc string.
    pub pixel_format: String,
    /// Requested field order.
    pub field_order: FieldOrder,
    /// Number of buffers to request from the driver.
    pub buffer_count: u32,
    /// Number of frames to capture before stopping.
    pub frame_limit: u32,
    /// Directory frames are written to.
    pub output_dir: PathBuf,
    /// File extension for written frames.
    pub file_extension: String,
    /// Upper bound on a single dequeue wait. Blocks indefinitely when unset.
    pub dequeue_timeout_ms: Option<u64>,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 720,
            pixel_format: "MJPG".to_owned(),
            field_order: FieldOrder::Interlaced,
            buffer_count: 4,
            frame_limit: 5,
            output_dir: PathBuf::from("."),
            file_extension: "jpg".to_owned(),
            dequeue_timeout_ms: None,
            log_level: "info".to_owned(),
        }
    }
}

impl CaptureConfig {
    /// Load defaults, then `path` if given, then `MMAP_CAM_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::Config(format!(
                "invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(CameraError::Config(
                "buffer_count must be at least 1".to_owned(),
            ));
        }
        if self.frame_limit == 0 {
            return Err(CameraError::Config(
                "frame_limit must be at least 1".to_owned(),
            ));
        }
        if self.file_extension.trim_start_matches('.').is_empty() {
            return Err(CameraError::Config(
                "file_extension must not be empty".to_owned(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(CameraError::Config(format!(
                "invalid log_level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        self.fourcc()?;
        Ok(())
    }

    /// Parsed pixel format.
    pub fn fourcc(&self) -> Result<FourCC> {
        self.pixel_format.parse()
    }

    /// Format request built from the configured geometry.
    pub fn format_request(&self) -> Result<FormatRequest> {
        Ok(FormatRequest::new(self.width, self.height, self.fourcc()?)
            .with_field_order(self.field_order))
    }

    /// Dequeue wait bound, if configured.
    pub fn dequeue_timeout(&self) -> Option<Duration> {
        self.dequeue_timeout_ms.map(Duration::from_millis)
    }
}
