//! Checks on capture results.
//!
//! These functions verify the output contract of a capture run: sequence
//! numbers without gaps, payloads within their buffers, and motion-JPEG
//! payloads that look like whole JPEG images. Useful for integration testing
//! with virtual cameras.

use crate::error::{CameraError, Result};
use crate::session::CaptureReport;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Validates that capture reports have incrementing sequence numbers.
///
/// # Errors
///
/// Returns `InvalidState` if:
/// - The reports slice is empty
/// - Any sequence number doesn't increment by exactly 1 from the previous
pub fn validate_frame_sequence(reports: &[CaptureReport]) -> Result<()> {
    if reports.is_empty() {
        return Err(CameraError::InvalidState {
            operation: "validate frame sequence",
            reason: "no frames were captured",
        });
    }

    for pair in reports.windows(2) {
        let [prev, curr] = pair else { continue };
        if curr.sequence != prev.sequence + 1 {
            return Err(CameraError::InvalidState {
                operation: "validate frame sequence",
                reason: "sequence numbers are not contiguous",
            });
        }
    }

    Ok(())
}

/// Validates that a frame's payload is non-empty and within its buffer.
pub fn validate_payload_bounds(report: &CaptureReport) -> Result<()> {
    if report.bytes_used == 0 || report.bytes_used > report.buffer_len {
        return Err(CameraError::PayloadOverrun {
            index: report.buffer_index,
            bytes_used: u32::try_from(report.bytes_used).unwrap_or(u32::MAX),
            length: report.buffer_len,
        });
    }
    Ok(())
}

/// Validates that `data` starts with a JPEG SOI marker and contains an EOI.
///
/// Some UVC cameras pad frames after the EOI, so the marker is searched for
/// rather than expected at the very end.
pub fn validate_jpeg(data: &[u8]) -> Result<()> {
    if !data.starts_with(&JPEG_SOI) {
        return Err(CameraError::InvalidState {
            operation: "validate JPEG",
            reason: "missing start-of-image marker",
        });
    }

    let has_eoi = data
        .get(JPEG_SOI.len()..)
        .is_some_and(|rest| rest.windows(2).any(|w| w == JPEG_EOI));
    if !has_eoi {
        return Err(CameraError::InvalidState {
            operation: "validate JPEG",
            reason: "missing end-of-image marker",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(sequence: u32, bytes_used: usize) -> CaptureReport {
        CaptureReport {
            sequence,
            buffer_index: sequence % 4,
            bytes_used,
            buffer_len: 1024,
            sink_error: None,
        }
    }

    #[test]
    fn test_validate_frame_sequence_success() {
        let reports: Vec<CaptureReport> = (0..5).map(|seq| report(seq, 100)).collect();
        let result = validate_frame_sequence(&reports);
        assert!(result.is_ok(), "sequence should validate: {result:?}");
    }

    #[test]
    fn test_validate_frame_sequence_empty() {
        assert!(validate_frame_sequence(&[]).is_err());
    }

    #[test]
    fn test_validate_frame_sequence_with_gap() {
        let reports = vec![report(0, 100), report(1, 100), report(3, 100)];
        assert!(validate_frame_sequence(&reports).is_err());
    }

    #[test]
    fn test_validate_payload_bounds() {
        assert!(validate_payload_bounds(&report(0, 1024)).is_ok());
        assert!(validate_payload_bounds(&report(0, 0)).is_err());
        assert!(matches!(
            validate_payload_bounds(&report(0, 1025)),
            Err(CameraError::PayloadOverrun {
                bytes_used: 1025,
                length: 1024,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_jpeg() {
        assert!(validate_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]).is_ok());
        assert!(validate_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9, 0x00, 0x00]).is_ok());
        assert!(validate_jpeg(&[0x00, 0xD8, 0xFF, 0xD9]).is_err());
        assert!(validate_jpeg(&[0xFF, 0xD8, 0x00, 0x00]).is_err());
        assert!(validate_jpeg(&[0xFF, 0xD8, 0xD9]).is_err());
        assert!(validate_jpeg(&[]).is_err());
    }
}
