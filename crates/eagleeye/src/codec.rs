//! Frame <-> compressed image conversion for the streaming endpoints.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{unix_now, Frame};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Turns a frame into the bytes sent to viewers.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError>;
}

/// Baseline JPEG at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct Jpeg {
    quality: u8,
}

impl Jpeg {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for Jpeg {
    fn default() -> Self {
        Self::new(80)
    }
}

impl FrameEncoder for Jpeg {
    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let color = match frame.channels {
            1 => ExtendedColorType::L8,
            3 => ExtendedColorType::Rgb8,
            n => return Err(CodecError::Encode(format!("unsupported channel count {}", n))),
        };
        let mut buf = Vec::with_capacity(frame.len() / 8);
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode(&frame.data, frame.width, frame.height, color)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

/// Decode a compressed image (JPEG or PNG) into an RGB frame stamped now.
pub fn decode_image(bytes: &[u8], source: &str) -> Result<Frame, CodecError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| CodecError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::new(source, width, height, 3, image.into_raw(), unix_now())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jpeg_encode_decodes_back_to_same_geometry() {
        let frame = Frame::new("rgb", 16, 8, 3, vec![128; 16 * 8 * 3], 0.0).unwrap();
        let jpeg = Jpeg::new(90).encode(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "JPEG SOI marker");

        let decoded = decode_image(&jpeg, "upload").unwrap();
        assert_eq!((decoded.width, decoded.height, decoded.channels), (16, 8, 3));
        assert_eq!(decoded.source, "upload");
    }

    #[test]
    fn test_grayscale_frames_encode() {
        let frame = Frame::new("thermal", 8, 8, 1, vec![200; 64], 0.0).unwrap();
        assert!(Jpeg::default().encode(&frame).is_ok());
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let err = decode_image(b"definitely not a jpeg", "upload").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
