//! Virtual camera output
//!
//! Decoded frames are re-published as a local camera device. Two driver
//! families sit behind [`VirtualCameraBackend`]:
//!
//! - **Custom**: the `webcamshare_camera.dll` softcam module on Windows,
//!   only tried when [`driver::diagnose`] reports a consistent registration.
//! - **Fallback**: a v4l2loopback output node on Linux.
//!
//! [`VirtualCamera`] picks between them on every start.

pub mod driver;
#[cfg(target_os = "linux")]
pub mod loopback;
pub mod pacer;
pub mod sink;
#[cfg(windows)]
pub mod softcam;

pub use driver::{
    DriverActionCode, DriverActionResult, DriverLocator, DriverStatus, DriverStatusCode,
};
pub use pacer::FramePacer;
pub use sink::{DriverSet, SessionInfo, StartCode, StartReport, VirtualCamera};

use crate::capture::Frame;
use crate::config::VirtualCameraConfig;
use crate::error::VirtualCameraError;

/// Which driver family a backend belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Custom,
    Fallback,
}

/// Byte order of the pixels a backend accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    /// Softcam-style drivers copy BGR24 rows straight into the DirectShow sample
    Bgr,
    Rgb,
}

impl ChannelOrder {
    /// Pixels of `frame` in this order, converted into `scratch` if needed
    pub fn arrange<'a>(self, frame: &'a Frame, scratch: &'a mut Vec<u8>) -> &'a [u8] {
        match self {
            ChannelOrder::Rgb => &frame.data,
            ChannelOrder::Bgr => {
                frame.write_bgr_into(scratch);
                scratch
            }
        }
    }
}

/// Fixed parameters of one virtual camera session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SessionFormat {
    pub fn frame_len(&self) -> usize {
        Frame::expected_len(self.width, self.height)
    }
}

/// One virtual camera driver
pub trait VirtualCameraBackend: Send {
    fn kind(&self) -> DriverKind;

    fn channel_order(&self) -> ChannelOrder;

    /// Create the device. Returns a human-readable device name.
    fn open(&mut self, format: &SessionFormat) -> Result<String, VirtualCameraError>;

    /// Deliver one full frame in [`channel_order`](Self::channel_order).
    /// Backends that pace themselves block here until the next frame slot.
    fn send(&mut self, pixels: &[u8]) -> Result<(), VirtualCameraError>;

    /// Tear the device down; safe when not open
    fn close(&mut self);
}

/// Drivers available on this platform
pub fn platform_drivers(config: &VirtualCameraConfig) -> DriverSet {
    let locator = DriverLocator::from_config(config);
    let diagnose_locator = locator.clone();
    let diagnose = Box::new(move || driver::diagnose(&diagnose_locator));

    #[cfg(windows)]
    let custom: Option<Box<dyn VirtualCameraBackend>> =
        Some(Box::new(softcam::SoftcamBackend::new(locator)));
    #[cfg(not(windows))]
    let custom: Option<Box<dyn VirtualCameraBackend>> = {
        let _ = locator;
        None
    };

    #[cfg(target_os = "linux")]
    let fallback: Option<Box<dyn VirtualCameraBackend>> =
        Some(Box::new(loopback::LoopbackBackend::new(None)));
    #[cfg(not(target_os = "linux"))]
    let fallback: Option<Box<dyn VirtualCameraBackend>> = None;

    DriverSet {
        diagnose,
        custom,
        fallback,
    }
}
