//! Frame consumers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CameraError, Result};
use crate::traits::Frame;
use crate::validation::validate_jpeg;

/// Consumer of captured frames.
///
/// A sink only persists: it receives the valid payload and the session
/// sequence number, and decides naming and location itself. Errors are
/// reported to the session but never stop capture.
pub trait FrameSink {
    /// Persist one frame.
    fn write_frame(&mut self, frame: &Frame<'_>) -> io::Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame<'_>) -> io::Result<()>,
{
    fn write_frame(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        self(frame)
    }
}

/// Writes each frame to `{dir}/{sequence}.{extension}`.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    extension: String,
}

impl FileSink {
    /// Create a sink writing into `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if let Err(source) = fs::create_dir_all(&dir) {
            return Err(CameraError::OutputDir { path: dir, source });
        }
        Ok(Self {
            dir,
            extension: extension.trim_start_matches('.').to_owned(),
        })
    }

    /// Path the frame with `sequence` is written to.
    pub fn path_for(&self, sequence: u32) -> PathBuf {
        self.dir.join(format!("{sequence}.{}", self.extension))
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        let path = self.path_for(frame.sequence);

        if self.extension.eq_ignore_ascii_case("jpg") {
            if let Err(err) = validate_jpeg(frame.data) {
                debug!(sequence = frame.sequence, %err, "payload is not a complete JPEG");
            }
        }

        fs::write(&path, frame.data)?;
        debug!(
            sequence = frame.sequence,
            bytes = frame.data.len(),
            path = %path.display(),
            "frame saved"
        );
        Ok(())
    }
}
