//! Capture backend abstraction
//!
//! A backend is one OS capture subsystem. It lists devices under its own
//! backend-local indices and opens them. Several backends usually report
//! the same physical camera; [`DeviceRegistry`](super::DeviceRegistry)
//! merges those sightings.

use crossbeam::channel::{bounded, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::frame::Frame;
use crate::error::CaptureError;

/// One device as reported by a single backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDevice {
    pub name: String,
    pub index: usize,
    /// Identifier that survives renames (bus path, symbolic link)
    pub stable_id: Option<String>,
}

impl BackendDevice {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            stable_id: None,
        }
    }

    pub fn with_stable_id(mut self, id: impl Into<String>) -> Self {
        self.stable_id = Some(id.into());
        self
    }
}

/// An OS capture subsystem
pub trait CaptureBackend: Send + Sync {
    /// Short identifier such as `v4l2-mjpeg`
    fn id(&self) -> &'static str;

    /// Confidence of a single, uncorroborated sighting
    fn base_confidence(&self) -> i32;

    /// List devices. An empty list is not an error.
    fn enumerate(&self) -> Result<Vec<BackendDevice>, CaptureError>;

    /// Open the device at a backend-local index
    fn open(&self, index: usize) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// An opened camera
pub trait CaptureDevice: Send {
    /// Block until the next frame is available
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Open `index` on `backend`, giving up after `timeout`.
///
/// The open runs on a helper thread; if it outlives the deadline the thread
/// is left to finish on its own and the late device is dropped.
pub fn open_with_timeout(
    backend: Arc<dyn CaptureBackend>,
    index: usize,
    timeout: Duration,
) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let id = backend.id();
    let (tx, rx) = bounded(1);

    thread::Builder::new()
        .name(format!("open-{}-{}", id, index))
        .spawn(move || {
            let _ = tx.send(backend.open(index));
        })
        .map_err(|e| CaptureError::Backend(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("Opening {}#{} timed out after {:?}", id, index, timeout);
            Err(CaptureError::OpenTimeout { backend: id, index })
        }
        Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Backend(format!(
            "open thread for {}#{} exited",
            id, index
        ))),
    }
}

/// Read up to `attempts` frames, returning the first non-empty one.
///
/// A device that opens but never produces a frame is reported as busy,
/// which is what another process holding the camera looks like.
pub fn probe_read(
    device: &mut dyn CaptureDevice,
    attempts: u32,
    interval: Duration,
) -> Result<Frame, CaptureError> {
    let mut last_error = None;

    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            thread::sleep(interval);
        }
        match device.read() {
            Ok(frame) if !frame.is_empty() => return Ok(frame),
            Ok(_) => {}
            Err(e @ CaptureError::PermissionDenied(_)) => return Err(e),
            Err(e) => last_error = Some(e),
        }
    }

    let detail = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no frames".to_string());
    Err(CaptureError::Busy(format!(
        "{} opened but produced no frames ({})",
        device.describe(),
        detail
    )))
}
