//! Video4Linux2 capture backend
//!
//! One backend type, registered twice: once asking devices for compressed
//! MJPG and once for raw YUYV. Most UVC cameras offer both, so the two
//! modes corroborate each other during enumeration and give the opener a
//! second route when one format is refused.

use std::sync::Arc;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::traits::{CaptureStream, Stream as V4lStream};
use v4l::video::Capture;
use v4l::FourCC;

use super::backend::{BackendDevice, CaptureBackend, CaptureDevice};
use super::frame::{yuyv_to_rgb8, Frame};
use crate::error::CaptureError;

const BUFFER_COUNT: u32 = 4;

/// Pixel format requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V4l2Mode {
    Mjpeg,
    Yuyv,
}

impl V4l2Mode {
    pub fn id(self) -> &'static str {
        match self {
            V4l2Mode::Mjpeg => "v4l2-mjpeg",
            V4l2Mode::Yuyv => "v4l2-yuyv",
        }
    }

    pub fn fourcc(self) -> FourCC {
        match self {
            V4l2Mode::Mjpeg => FourCC::new(b"MJPG"),
            V4l2Mode::Yuyv => FourCC::new(b"YUYV"),
        }
    }

    pub fn base_confidence(self) -> i32 {
        match self {
            V4l2Mode::Mjpeg => 120,
            V4l2Mode::Yuyv => 100,
        }
    }
}

pub struct V4l2Backend {
    mode: V4l2Mode,
    resolution: Option<(u32, u32)>,
}

impl V4l2Backend {
    pub fn new(mode: V4l2Mode, resolution: Option<(u32, u32)>) -> Self {
        Self { mode, resolution }
    }
}

impl CaptureBackend for V4l2Backend {
    fn id(&self) -> &'static str {
        self.mode.id()
    }

    fn base_confidence(&self) -> i32 {
        self.mode.base_confidence()
    }

    fn enumerate(&self) -> Result<Vec<BackendDevice>, CaptureError> {
        let wanted = self.mode.fourcc();
        let mut devices = Vec::new();

        for node in v4l::context::enum_devices() {
            let Ok(dev) = v4l::Device::with_path(node.path()) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            // skip metadata and output nodes
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            let offers_format = dev
                .enum_formats()
                .map(|formats| formats.iter().any(|f| f.fourcc == wanted))
                .unwrap_or(false);
            if !offers_format {
                continue;
            }

            let name = node.name().unwrap_or_else(|| caps.card.clone());
            devices.push(BackendDevice::new(name, node.index()).with_stable_id(caps.bus));
        }

        Ok(devices)
    }

    fn open(&self, index: usize) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let path = format!("/dev/video{}", index);
        let dev = v4l::Device::new(index).map_err(|e| CaptureError::from_open_io(&path, e))?;

        let mut fmt = dev
            .format()
            .map_err(|e| CaptureError::from_open_io(&path, e))?;
        fmt.fourcc = self.mode.fourcc();
        if let Some((width, height)) = self.resolution {
            fmt.width = width;
            fmt.height = height;
        }
        let applied = dev
            .set_format(&fmt)
            .map_err(|e| CaptureError::from_open_io(&path, e))?;
        if applied.fourcc != self.mode.fourcc() {
            return Err(CaptureError::FormatNotSupported(format!(
                "{} refused {}, offered {}",
                path,
                self.mode.fourcc(),
                applied.fourcc
            )));
        }

        let name = dev
            .query_caps()
            .map(|caps| caps.card)
            .unwrap_or_else(|_| path.clone());

        let dev = Arc::new(dev);
        let mut stream = v4l::io::mmap::Stream::with_buffers(&dev, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| CaptureError::from_open_io(&path, e))?;
        V4lStream::start(&mut stream).map_err(|e| CaptureError::from_open_io(&path, e))?;

        tracing::info!(
            "Opened {} ({}) at {}x{} {}",
            name,
            path,
            applied.width,
            applied.height,
            applied.fourcc
        );

        Ok(Box::new(V4l2Device {
            stream,
            dev,
            mode: self.mode,
            name,
            path,
            width: applied.width,
            height: applied.height,
        }))
    }
}

struct V4l2Device {
    stream: v4l::io::mmap::Stream<'static>,
    dev: Arc<v4l::Device>,
    mode: V4l2Mode,
    name: String,
    path: String,
    width: u32,
    height: u32,
}

// The mmap stream holds raw pointers into buffers owned by `dev`, which
// lives as long as the stream.
unsafe impl Send for V4l2Device {}

impl V4l2Device {
    fn adopt_size(&mut self, width: u32, height: u32) {
        if (width, height) != (self.width, self.height) {
            tracing::info!(
                "{} switched from {}x{} to {}x{}",
                self.path,
                self.width,
                self.height,
                width,
                height
            );
            self.width = width;
            self.height = height;
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let (buf, meta) = CaptureStream::next(&mut self.stream)
            .map_err(|e| CaptureError::ReadFailed(format!("{}: {}", self.path, e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(CaptureError::ReadFailed(format!("{}: empty buffer", self.path)));
        }
        let data = buf[..used].to_vec();

        match self.mode {
            V4l2Mode::Mjpeg => {
                let image = image::load_from_memory_with_format(&data, image::ImageFormat::Jpeg)
                    .map_err(|e| CaptureError::ReadFailed(format!("{}: {}", self.path, e)))?
                    .into_rgb8();
                self.adopt_size(image.width(), image.height());
                Ok(Frame {
                    width: image.width(),
                    height: image.height(),
                    data: image.into_raw(),
                })
            }
            V4l2Mode::Yuyv => {
                if data.len() != self.width as usize * self.height as usize * 2 {
                    let fmt = self
                        .dev
                        .format()
                        .map_err(|e| CaptureError::ReadFailed(format!("{}: {}", self.path, e)))?;
                    self.adopt_size(fmt.width, fmt.height);
                }
                Ok(Frame {
                    width: self.width,
                    height: self.height,
                    data: yuyv_to_rgb8(&data, self.width, self.height),
                })
            }
        }
    }

    fn describe(&self) -> String {
        format!("{} ({}, {})", self.name, self.path, self.mode.id())
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Err(e) = V4lStream::stop(&mut self.stream) {
            tracing::debug!("Stopping {} failed: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_ranking() {
        assert!(V4l2Mode::Mjpeg.base_confidence() > V4l2Mode::Yuyv.base_confidence());
        assert_eq!(
            V4l2Mode::Yuyv.base_confidence() + crate::capture::registry::CORROBORATION_BONUS,
            105
        );
        assert_ne!(V4l2Mode::Mjpeg.id(), V4l2Mode::Yuyv.id());
    }
}
