//! v4l2loopback output (Linux)
//!
//! Writes whole RGB24 frames to a loopback node with `write(2)`. The
//! module has no clock of its own, so delivery is paced with a
//! [`FramePacer`].

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use v4l::video::Output;
use v4l::FourCC;

use super::pacer::FramePacer;
use super::{ChannelOrder, DriverKind, SessionFormat, VirtualCameraBackend};
use crate::error::VirtualCameraError;

/// Driver name reported by `VIDIOC_QUERYCAP` on loopback nodes
pub const LOOPBACK_DRIVER: &str = "v4l2 loopback";

/// First loopback node on the system, if any
pub fn find_loopback_node() -> Option<PathBuf> {
    v4l::context::enum_devices().into_iter().find_map(|node| {
        let dev = v4l::Device::with_path(node.path()).ok()?;
        let caps = dev.query_caps().ok()?;
        (caps.driver == LOOPBACK_DRIVER).then(|| node.path().to_path_buf())
    })
}

struct Open {
    // keeps the negotiated format alive while we write
    _dev: v4l::Device,
    out: File,
    path: PathBuf,
    pacer: FramePacer,
    frame_len: usize,
}

pub struct LoopbackBackend {
    node: Option<PathBuf>,
    open: Option<Open>,
}

impl LoopbackBackend {
    /// Use `node`, or the first loopback device found at open time
    pub fn new(node: Option<PathBuf>) -> Self {
        Self { node, open: None }
    }
}

impl VirtualCameraBackend for LoopbackBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Fallback
    }

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    fn open(&mut self, format: &SessionFormat) -> Result<String, VirtualCameraError> {
        self.close();

        let path = self
            .node
            .clone()
            .or_else(find_loopback_node)
            .ok_or_else(|| {
                VirtualCameraError::DriverUnavailable(
                    "no v4l2loopback device found (modprobe v4l2loopback)".into(),
                )
            })?;
        let fail = |e: std::io::Error| {
            VirtualCameraError::StartFailed(format!("{}: {}", path.display(), e))
        };

        let dev = v4l::Device::with_path(&path).map_err(fail)?;
        let wanted = v4l::Format::new(format.width, format.height, FourCC::new(b"RGB3"));
        let applied = Output::set_format(&dev, &wanted).map_err(fail)?;
        if (applied.width, applied.height) != (format.width, format.height)
            || applied.fourcc != wanted.fourcc
        {
            return Err(VirtualCameraError::StartFailed(format!(
                "{} accepted {}x{} {} instead of {}x{} RGB3",
                path.display(),
                applied.width,
                applied.height,
                applied.fourcc,
                format.width,
                format.height
            )));
        }

        let out = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(fail)?;

        let device = path.display().to_string();
        tracing::info!(
            "Loopback output {} at {}x{} @ {} fps",
            device,
            format.width,
            format.height,
            format.fps
        );
        self.open = Some(Open {
            _dev: dev,
            out,
            path,
            pacer: FramePacer::new(format.fps),
            frame_len: format.frame_len(),
        });
        Ok(device)
    }

    fn send(&mut self, pixels: &[u8]) -> Result<(), VirtualCameraError> {
        let open = self.open.as_mut().ok_or(VirtualCameraError::NotStarted)?;
        if pixels.len() != open.frame_len {
            return Err(VirtualCameraError::SendFailed(format!(
                "expected {} bytes, got {}",
                open.frame_len,
                pixels.len()
            )));
        }
        open.out.write_all(pixels).map_err(|e| {
            VirtualCameraError::SendFailed(format!("{}: {}", open.path.display(), e))
        })?;
        open.pacer.wait();
        Ok(())
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            tracing::debug!("Closed loopback output {}", open.path.display());
        }
    }
}
