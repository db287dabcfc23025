//! In-process camera backend
//!
//! Serves looping frame lists instead of hardware. Used by the sender's
//! test-pattern mode and by tests that need a camera with a specific
//! failure mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::backend::{BackendDevice, CaptureBackend, CaptureDevice};
use super::frame::Frame;
use crate::error::CaptureError;

/// How a synthetic camera reacts to enumeration, open and read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Listed, opens, loops its frames
    Healthy,
    /// Listed, opens, never produces a frame
    Busy,
    /// Listed, open fails with an access-denied error
    PermissionDenied,
    /// Listed, open fails
    Unopenable,
    /// Not listed, but opens like `Healthy` when probed by index
    Hidden,
}

/// One fake camera
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub name: String,
    pub stable_id: Option<String>,
    pub frames: Vec<Frame>,
    /// Delay of each read
    pub interval: Duration,
    pub behaviour: Behaviour,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>, frames: Vec<Frame>) -> Self {
        Self {
            name: name.into(),
            stable_id: None,
            frames,
            interval: Duration::from_millis(10),
            behaviour: Behaviour::Healthy,
        }
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stable_id(mut self, id: impl Into<String>) -> Self {
        self.stable_id = Some(id.into());
        self
    }
}

/// Backend serving [`SyntheticCamera`]s at their list positions
pub struct SyntheticBackend {
    id: &'static str,
    confidence: i32,
    cameras: Vec<SyntheticCamera>,
    opens: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn new(id: &'static str, confidence: i32, cameras: Vec<SyntheticCamera>) -> Self {
        Self {
            id,
            confidence,
            cameras,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Single healthy camera showing a moving colour pattern
    pub fn test_pattern(width: u32, height: u32, fps: u32) -> Self {
        let camera = SyntheticCamera::new("Test Pattern", test_pattern(width, height, 8))
            .with_interval(Duration::from_secs_f64(1.0 / fps.max(1) as f64))
            .with_stable_id("synthetic:test-pattern");
        Self::new("synthetic", 50, vec![camera])
    }

    /// Number of open calls served so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Shared counter of open calls, for observing a backend once it is boxed
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn id(&self) -> &'static str {
        self.id
    }

    fn base_confidence(&self) -> i32 {
        self.confidence
    }

    fn enumerate(&self) -> Result<Vec<BackendDevice>, CaptureError> {
        Ok(self
            .cameras
            .iter()
            .enumerate()
            .filter(|(_, cam)| cam.behaviour != Behaviour::Hidden)
            .map(|(index, cam)| BackendDevice {
                name: cam.name.clone(),
                index,
                stable_id: cam.stable_id.clone(),
            })
            .collect())
    }

    fn open(&self, index: usize) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let camera = self
            .cameras
            .get(index)
            .ok_or_else(|| CaptureError::DeviceNotFound(format!("{}#{}", self.id, index)))?;

        match camera.behaviour {
            Behaviour::PermissionDenied => Err(CaptureError::PermissionDenied(format!(
                "{}: access denied",
                camera.name
            ))),
            Behaviour::Unopenable => Err(CaptureError::Backend(format!(
                "{}: cannot open device",
                camera.name
            ))),
            Behaviour::Healthy | Behaviour::Hidden | Behaviour::Busy => {
                Ok(Box::new(SyntheticDevice {
                    camera: camera.clone(),
                    backend: self.id,
                    index,
                    position: 0,
                }))
            }
        }
    }
}

struct SyntheticDevice {
    camera: SyntheticCamera,
    backend: &'static str,
    index: usize,
    position: usize,
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        thread::sleep(self.camera.interval);

        if self.camera.behaviour == Behaviour::Busy || self.camera.frames.is_empty() {
            return Err(CaptureError::ReadFailed(format!(
                "{}: no frame",
                self.camera.name
            )));
        }

        let frame = self.camera.frames[self.position % self.camera.frames.len()].clone();
        self.position = self.position.wrapping_add(1);
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("{} ({}#{})", self.camera.name, self.backend, self.index)
    }
}

/// `count` frames of vertical colour bars, shifted one bar per frame
pub fn test_pattern(width: u32, height: u32, count: usize) -> Vec<Frame> {
    const BARS: [[u8; 3]; 8] = [
        [255, 255, 255],
        [255, 255, 0],
        [0, 255, 255],
        [0, 255, 0],
        [255, 0, 255],
        [255, 0, 0],
        [0, 0, 255],
        [0, 0, 0],
    ];

    (0..count.max(1))
        .map(|shift| {
            let mut data = Vec::with_capacity(Frame::expected_len(width, height));
            for _y in 0..height {
                for x in 0..width {
                    let bar = (x as usize * BARS.len() / width.max(1) as usize + shift) % BARS.len();
                    data.extend_from_slice(&BARS[bar]);
                }
            }
            Frame {
                width,
                height,
                data,
            }
        })
        .collect()
}
