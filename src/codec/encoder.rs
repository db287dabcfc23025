//! JPEG encoder wrapper
//!
//! Encodes RGB8 frames at a configurable quality.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;

use crate::capture::Frame;
use crate::error::CodecError;

/// JPEG encoder with statistics
pub struct JpegEncoder {
    quality: u8,
    /// Size of the last output, used to pre-size the next buffer
    size_hint: usize,
    /// Frames encoded
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl JpegEncoder {
    /// Create an encoder; quality must be within 1..=100
    pub fn new(quality: u8) -> Result<Self, CodecError> {
        Self::check_quality(quality)?;
        Ok(Self {
            quality,
            size_hint: 0,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn check_quality(quality: u8) -> Result<(), CodecError> {
        if !(1..=100).contains(&quality) {
            return Err(CodecError::EncodingFailed(format!(
                "JPEG quality {} outside 1-100",
                quality
            )));
        }
        Ok(())
    }

    /// Encode one frame
    pub fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError> {
        let expected = Frame::expected_len(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: frame.data.len(),
            });
        }

        let mut out = Vec::with_capacity(self.size_hint.max(1024));
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.size_hint = out.len() + out.len() / 8;
        self.frames_encoded += 1;
        self.bytes_produced += out.len() as u64;

        Ok(Bytes::from(out))
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
