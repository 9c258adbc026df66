//! Frames produced by capture sources.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch as a float, the timestamp unit used on the wire.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A captured image: interleaved 8-bit pixels (1 = gray, 3 = RGB).
///
/// Frames are moved from the worker into its channel and from there into the
/// hub; nothing mutates a frame once it has been published.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Capture time, unix seconds
    pub timestamp: f64,
    /// Name of the source that produced this frame
    pub source: String,
}

impl Frame {
    /// Build a frame, checking that the buffer matches the geometry.
    pub fn new(
        source: impl Into<String>,
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
        timestamp: f64,
    ) -> Result<Self, FrameError> {
        if channels != 1 && channels != 3 {
            return Err(FrameError::Channels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::Size {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            timestamp,
            source: source.into(),
        })
    }

    /// An all-black frame.
    pub fn blank(source: impl Into<String>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * channels as usize],
            width,
            height,
            channels,
            timestamp: unix_now(),
            source: source.into(),
        }
    }

    /// Bytes per row.
    #[inline]
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    Channels(u8),
    #[error("pixel buffer holds {actual} bytes, geometry needs {expected}")]
    Size { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_geometry() {
        assert!(Frame::new("rgb", 2, 2, 3, vec![0; 12], 0.0).is_ok());
        assert_eq!(
            Frame::new("rgb", 2, 2, 3, vec![0; 11], 0.0),
            Err(FrameError::Size {
                expected: 12,
                actual: 11
            })
        );
        assert_eq!(
            Frame::new("rgb", 2, 2, 4, vec![0; 16], 0.0),
            Err(FrameError::Channels(4))
        );
    }

    #[test]
    fn test_blank_frame() {
        let frame = Frame::blank("thermal", 4, 3, 1);
        assert_eq!(frame.len(), 12);
        assert_eq!(frame.stride(), 4);
        assert!(frame.data.iter().all(|&b| b == 0));
        assert!(frame.timestamp > 0.0);
    }
}
