//! JPEG decoder wrapper

use image::ImageFormat;

use crate::capture::Frame;
use crate::error::CodecError;

/// JPEG decoder producing RGB8 frames
#[derive(Default)]
pub struct JpegDecoder {
    /// Frames decoded
    frames_decoded: u64,
    /// Payloads that failed to decode
    decode_failures: u64,
    /// Total compressed bytes consumed
    bytes_consumed: u64,
}

impl JpegDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one JPEG image
    pub fn decode(&mut self, jpeg: &[u8]) -> Result<Frame, CodecError> {
        let image = match image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg) {
            Ok(image) => image.into_rgb8(),
            Err(e) => {
                self.decode_failures += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        self.frames_decoded += 1;
        self.bytes_consumed += jpeg.len() as u64;

        Ok(Frame {
            width: image.width(),
            height: image.height(),
            data: image.into_raw(),
        })
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            decode_failures: self.decode_failures,
            bytes_consumed: self.bytes_consumed,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub bytes_consumed: u64,
}
