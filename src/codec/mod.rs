//! JPEG codec wrappers
//!
//! The sender encodes every captured frame once; the receiver decodes each
//! extracted part. Both keep running statistics.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderStats, JpegDecoder};
pub use encoder::{EncoderStats, JpegEncoder};
