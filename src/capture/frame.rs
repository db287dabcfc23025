//! Decoded video frames and pixel conversions

use crate::error::CodecError;

/// Tightly packed RGB8 image, row-major
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Bytes needed for an RGB8 frame of the given size
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    /// Wrap an RGB8 buffer, checking its length
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CodecError> {
        let expected = Self::expected_len(width, height);
        if data.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel at (x, y) as `[r, g, b]`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Copy into `out` as RGB24, reusing its allocation
    pub fn write_rgb_into(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&self.data);
    }

    /// Copy into `out` as BGR24, reusing its allocation
    pub fn write_bgr_into(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.data.len());
        for px in self.data.chunks_exact(3) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Convert packed YUYV 4:2:2 into RGB8.
///
/// Odd trailing bytes are ignored; the output is always `width * height * 3`.
pub fn yuyv_to_rgb8(src: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut dest = vec![0u8; Frame::expected_len(width, height)];

    for (i, quad) in src.chunks_exact(4).enumerate() {
        let idx = i * 6;
        if idx + 5 >= dest.len() {
            break;
        }

        let c0 = quad[0] as i32 - 16;
        let d = quad[1] as i32 - 128;
        let c1 = quad[2] as i32 - 16;
        let e = quad[3] as i32 - 128;

        dest[idx] = clip((298 * c0 + 409 * e + 128) >> 8);
        dest[idx + 1] = clip((298 * c0 - 100 * d - 208 * e + 128) >> 8);
        dest[idx + 2] = clip((298 * c0 + 516 * d + 128) >> 8);
        dest[idx + 3] = clip((298 * c1 + 409 * e + 128) >> 8);
        dest[idx + 4] = clip((298 * c1 - 100 * d - 208 * e + 128) >> 8);
        dest[idx + 5] = clip((298 * c1 + 516 * d + 128) >> 8);
    }

    dest
}

#[inline]
fn clip(val: i32) -> u8 {
    val.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        assert!(Frame::new(2, 2, vec![0; 12]).is_ok());
        assert!(matches!(
            Frame::new(2, 2, vec![0; 11]),
            Err(CodecError::InvalidFrameSize {
                expected: 12,
                actual: 11
            })
        ));
    }

    #[test]
    fn test_bgr_swaps_channels() {
        let frame = Frame::solid(2, 1, [10, 20, 30]);
        let mut out = Vec::new();
        frame.write_bgr_into(&mut out);
        assert_eq!(out, vec![30, 20, 10, 30, 20, 10]);
        // source untouched
        assert_eq!(frame.pixel(1, 0), Some([10, 20, 30]));
    }

    #[test]
    fn test_yuyv_grey() {
        // Y=126 with neutral chroma maps to mid grey on every channel
        let src = [126u8, 128, 126, 128];
        let rgb = yuyv_to_rgb8(&src, 2, 1);
        assert_eq!(rgb.len(), 6);
        assert!(rgb.iter().all(|&c| c == rgb[0]));
        assert!((120..=135).contains(&rgb[0]));
    }

    #[test]
    fn test_yuyv_short_input_is_padded() {
        let rgb = yuyv_to_rgb8(&[], 4, 4);
        assert_eq!(rgb.len(), 48);
    }
}
