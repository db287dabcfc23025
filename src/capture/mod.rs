//! Camera capture subsystem

pub mod backend;
pub mod frame;
pub mod registry;
pub mod source;
pub mod synthetic;
#[cfg(target_os = "linux")]
pub mod v4l2;

pub use backend::{BackendDevice, CaptureBackend, CaptureDevice};
pub use frame::Frame;
pub use registry::{
    AvailabilityState, CameraDescriptor, DeviceRegistry, DeviceSnapshot, OpenCandidate,
};
pub use source::{ActiveCamera, CameraSelector, EncodedFrame, FrameSource, FrameStore};
pub use synthetic::{SyntheticBackend, SyntheticCamera};

use std::sync::Arc;

use crate::config::CaptureConfig;

/// Hardware backends available on this platform, highest priority first
pub fn platform_backends(config: &CaptureConfig) -> Vec<Arc<dyn CaptureBackend>> {
    #[cfg(target_os = "linux")]
    {
        use v4l2::{V4l2Backend, V4l2Mode};
        vec![
            Arc::new(V4l2Backend::new(V4l2Mode::Mjpeg, config.preferred_resolution)),
            Arc::new(V4l2Backend::new(V4l2Mode::Yuyv, config.preferred_resolution)),
        ]
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        tracing::warn!("No camera backend for this platform; use the synthetic source");
        Vec::new()
    }
}
