//! Incremental MJPEG frame extraction
//!
//! Feeds arbitrary body chunks in and pulls complete `FFD8 .. FFD9` JPEG
//! payloads out. Multipart headers and boundaries between frames are
//! skipped as garbage, so the parser does not depend on `Content-Length`.
//!
//! The accumulation buffer never exceeds its cap: when it would, everything
//! before the most recent start marker is discarded, and if that is still
//! too much the partial frame is dropped as well.

use bytes::{Buf, Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Parser counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub bytes_in: u64,
    pub frames_out: u64,
    /// Times the cap forced a trim
    pub cap_trims: u64,
    /// Bytes discarded as garbage or by trims
    pub bytes_dropped: u64,
}

pub struct MjpegParser {
    buf: BytesMut,
    cap: usize,
    /// Offset where the next end-marker search resumes
    scan_from: usize,
    stats: ParserStats,
}

impl MjpegParser {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(4);
        Self {
            buf: BytesMut::with_capacity(cap.min(64 * 1024)),
            cap,
            scan_from: 0,
            stats: ParserStats::default(),
        }
    }

    /// Append a chunk, trimming if the cap is exceeded
    pub fn push(&mut self, chunk: &[u8]) {
        self.stats.bytes_in += chunk.len() as u64;
        self.buf.extend_from_slice(chunk);

        if self.buf.len() > self.cap {
            self.enforce_cap();
        }
    }

    fn enforce_cap(&mut self) {
        self.stats.cap_trims += 1;

        if let Some(pos) = rfind(&self.buf, &SOI) {
            if pos > 0 {
                self.discard(pos);
            }
        }

        if self.buf.len() > self.cap {
            // a frame larger than the cap can never complete
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let len = self.buf.len();
            self.discard(len - keep);
        }

        tracing::debug!("MJPEG buffer over cap, {} bytes kept", self.buf.len());
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.bytes_dropped += n as u64;
        self.scan_from = 0;
    }

    /// Extract the next complete JPEG, if the buffer holds one
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        match find(&self.buf, &SOI, 0) {
            Some(0) => {}
            Some(pos) => self.discard(pos),
            None => {
                // only a trailing 0xFF can still become part of a marker
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let len = self.buf.len();
                if len > keep {
                    self.discard(len - keep);
                }
                return None;
            }
        }

        match find(&self.buf, &EOI, self.scan_from.max(SOI.len())) {
            Some(end) => {
                let frame = self.buf.split_to(end + EOI.len()).freeze();
                self.scan_from = 0;
                self.stats.frames_out += 1;
                Some(frame)
            }
            None => {
                self.scan_from = self.buf.len().saturating_sub(1);
                None
            }
        }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn rfind(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).rposition(|w| w == needle)
}
