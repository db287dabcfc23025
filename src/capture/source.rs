//! Camera capture loop
//!
//! A [`FrameSource`] owns one opened camera and a dedicated thread that
//! reads, JPEG-encodes and publishes every frame into a [`FrameStore`].
//! The store is what the HTTP server and previews read from.

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::backend::{open_with_timeout, probe_read, CaptureDevice};
use super::frame::Frame;
use super::registry::{DeviceRegistry, OpenCandidate};
use crate::codec::JpegEncoder;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, OpenAttempt};
use crate::network::JpegFeed;

/// Encoded JPEG tagged with the capture generation it came from
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub generation: u64,
    pub jpeg: Bytes,
}

#[derive(Default)]
struct Latest {
    raw: Option<Arc<Frame>>,
    encoded: Option<EncodedFrame>,
    generation: u64,
}

/// Latest raw and encoded frame, replaced together under one lock
#[derive(Default)]
pub struct FrameStore {
    inner: Mutex<Latest>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both frames and return the new generation
    pub fn publish(&self, frame: Frame, jpeg: Bytes) -> u64 {
        let raw = Arc::new(frame);
        let mut latest = self.inner.lock();
        latest.generation += 1;
        let generation = latest.generation;
        latest.raw = Some(raw);
        latest.encoded = Some(EncodedFrame { generation, jpeg });
        generation
    }

    /// Read-only view of the latest raw frame
    pub fn raw(&self) -> Option<Arc<Frame>> {
        self.inner.lock().raw.clone()
    }

    pub fn encoded(&self) -> Option<EncodedFrame> {
        self.inner.lock().encoded.clone()
    }

    /// Both halves of the latest generation
    pub fn latest(&self) -> Option<(Arc<Frame>, EncodedFrame)> {
        let latest = self.inner.lock();
        match (&latest.raw, &latest.encoded) {
            (Some(raw), Some(encoded)) => Some((raw.clone(), encoded.clone())),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Drop the frames; the generation keeps counting
    pub fn clear(&self) {
        let mut latest = self.inner.lock();
        latest.raw = None;
        latest.encoded = None;
    }
}

impl JpegFeed for FrameStore {
    fn latest_jpeg(&self) -> Option<EncodedFrame> {
        self.encoded()
    }
}

/// How the caller names the camera to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    /// Descriptor key from the registry
    Key(String),
    /// Backend-local index on the highest-priority backend
    Index(usize),
}

impl FromStr for CameraSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<usize>() {
            Ok(index) => CameraSelector::Index(index),
            Err(_) => CameraSelector::Key(s.trim().to_string()),
        })
    }
}

impl std::fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraSelector::Key(key) => write!(f, "{}", key),
            CameraSelector::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// The camera a running source adopted
#[derive(Debug, Clone)]
pub struct ActiveCamera {
    pub label: String,
    pub backend: &'static str,
    pub index: usize,
    pub description: String,
}

/// Capture loop counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames_captured: AtomicU64,
    pub read_failures: AtomicU64,
    pub encode_failures: AtomicU64,
    pub size_changes: AtomicU64,
}

/// Owns one camera and its capture thread
pub struct FrameSource {
    registry: Arc<DeviceRegistry>,
    config: CaptureConfig,
    store: Arc<FrameStore>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
    active: Option<ActiveCamera>,
    stats: Arc<CaptureStats>,
}

impl FrameSource {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            config,
            store: Arc::new(FrameStore::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            done_rx: None,
            active: None,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Open the selected camera and start the capture thread.
    ///
    /// Candidates are tried in priority order; the first one that opens and
    /// yields a frame is adopted. Fails with [`CaptureError::Open`] listing
    /// every attempt when none does.
    pub fn start(&mut self, selector: &CameraSelector) -> Result<(), CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut encoder = JpegEncoder::new(self.config.jpeg_quality)
            .map_err(|e| CaptureError::Backend(e.to_string()))?;
        let (label, candidates) = self.resolve(selector)?;
        let (mut device, first, candidate) = self.open_first(&label, candidates)?;

        let description = device.describe();
        tracing::info!(
            "Capturing from {} at {}x{} (JPEG quality {})",
            description,
            first.width,
            first.height,
            encoder.quality()
        );

        match encoder.encode(&first) {
            Ok(jpeg) => {
                self.store.publish(first, jpeg);
                self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("Encoding first frame failed: {}", e);
                self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (done_tx, done_rx) = bounded::<()>(1);
        // a thread detached by an earlier stop keeps its own, cleared flag
        self.running = Arc::new(AtomicBool::new(false));
        let running = self.running.clone();
        let store = self.store.clone();
        let stats = self.stats.clone();
        let retry = self.config.read_retry();
        let mut size = self.store.raw().map(|f| f.size());

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("capture-{}", label))
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let frame = match device.read() {
                        Ok(frame) if !frame.is_empty() => frame,
                        Ok(_) => {
                            thread::sleep(retry);
                            continue;
                        }
                        Err(e) => {
                            stats.read_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("Read failed: {}", e);
                            thread::sleep(retry);
                            continue;
                        }
                    };

                    if !running.load(Ordering::Relaxed) {
                        break;
                    }

                    if size != Some(frame.size()) {
                        if let Some((w, h)) = size {
                            tracing::info!(
                                "Camera size changed {}x{} -> {}x{}",
                                w,
                                h,
                                frame.width,
                                frame.height
                            );
                            stats.size_changes.fetch_add(1, Ordering::Relaxed);
                        }
                        size = Some(frame.size());
                    }

                    match encoder.encode(&frame) {
                        Ok(jpeg) => {
                            store.publish(frame, jpeg);
                            stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Encoding failed: {}", e);
                        }
                    }
                }

                let encoded = encoder.stats();
                tracing::debug!(
                    "Capture thread exiting after {} frames (avg {:.0} bytes)",
                    encoded.frames_encoded,
                    encoded.average_frame_size
                );

                // release the camera before reporting completion
                drop(device);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CaptureError::Backend(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        self.done_rx = Some(done_rx);
        self.active = Some(ActiveCamera {
            label,
            backend: candidate.backend,
            index: candidate.index,
            description,
        });
        Ok(())
    }

    fn resolve(
        &self,
        selector: &CameraSelector,
    ) -> Result<(String, Vec<OpenCandidate>), CaptureError> {
        match selector {
            CameraSelector::Key(key) => {
                let descriptor = self
                    .registry
                    .lookup(key)
                    .ok_or_else(|| CaptureError::DeviceNotFound(key.clone()))?;
                Ok((descriptor.key.clone(), descriptor.ordered_candidates()))
            }
            CameraSelector::Index(index) => {
                let backend = self
                    .registry
                    .primary_backend()
                    .ok_or_else(|| CaptureError::DeviceNotFound("no capture backend".into()))?;
                Ok((
                    format!("{}-{}", backend.id(), index),
                    vec![OpenCandidate {
                        backend: backend.id(),
                        index: *index,
                        confidence: backend.base_confidence(),
                    }],
                ))
            }
        }
    }

    fn open_first(
        &self,
        label: &str,
        candidates: Vec<OpenCandidate>,
    ) -> Result<(Box<dyn CaptureDevice>, Frame, OpenCandidate), CaptureError> {
        let mut attempts = Vec::new();

        for candidate in candidates {
            let Some(backend) = self.registry.backend(candidate.backend) else {
                continue;
            };

            let result = open_with_timeout(backend, candidate.index, self.config.open_timeout())
                .and_then(|mut device| {
                    let frame = probe_read(
                        device.as_mut(),
                        self.config.probe_read_attempts,
                        self.config.probe_read_interval(),
                    )?;
                    Ok((device, frame))
                });

            match result {
                Ok((device, frame)) => return Ok((device, frame, candidate)),
                Err(e) => {
                    tracing::debug!("{}#{} unusable: {}", candidate.backend, candidate.index, e);
                    attempts.push(OpenAttempt {
                        backend: candidate.backend,
                        index: candidate.index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(CaptureError::Open {
            target: label.to_string(),
            attempts,
        })
    }

    /// Stop the capture thread and release the camera. Safe to call twice.
    ///
    /// Waits at most the configured stop timeout for a wedged read; past
    /// that the thread is detached. It exits once the read returns, without
    /// publishing, even if the source has been started again.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let finished = match self.done_rx.take() {
                Some(rx) => !matches!(
                    rx.recv_timeout(self.config.stop_timeout()),
                    Err(RecvTimeoutError::Timeout)
                ),
                None => true,
            };

            if finished {
                let _ = handle.join();
            } else {
                tracing::warn!("Capture thread did not stop in time, detaching");
            }
        }

        if let Some(active) = self.active.take() {
            tracing::info!("Stopped capturing from {}", active.description);
        }
        self.store.clear();
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_camera(&self) -> Option<&ActiveCamera> {
        self.active.as_ref()
    }

    /// Owned copy of the latest frame
    pub fn get_frame_copy(&self) -> Option<Frame> {
        self.store.raw().map(|frame| (*frame).clone())
    }

    /// Shared view of the latest frame; hold it briefly
    pub fn get_frame_view(&self) -> Option<Arc<Frame>> {
        self.store.raw()
    }

    /// Latest JPEG bytes
    pub fn get_encoded_frame(&self) -> Option<Bytes> {
        self.store.encoded().map(|e| e.jpeg)
    }

    /// Dimensions of the latest frame
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.store.raw().map(|f| f.size())
    }

    /// Store shared with servers and previews
    pub fn store(&self) -> Arc<FrameStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::{BackendDevice, CaptureBackend};
    use crate::capture::synthetic::{Behaviour, SyntheticBackend, SyntheticCamera};
    use std::time::{Duration, Instant};

    fn config() -> CaptureConfig {
        CaptureConfig {
            probe_read_interval_ms: 1,
            read_retry_ms: 5,
            ..Default::default()
        }
    }

    fn registry(cameras: Vec<SyntheticCamera>) -> Arc<DeviceRegistry> {
        let backend: Arc<dyn CaptureBackend> = Arc::new(SyntheticBackend::new("fake", 100, cameras));
        Arc::new(DeviceRegistry::new(vec![backend], config()))
    }

    fn two_frames() -> Vec<Frame> {
        vec![Frame::solid(4, 4, [255, 0, 0]), Frame::solid(4, 4, [0, 255, 0])]
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_by_key_publishes_frames() {
        let registry = registry(vec![SyntheticCamera::new("Desk Cam", two_frames())
            .with_interval(Duration::from_millis(5))]);
        let key = registry.enumerate()[0].key.clone();

        let mut source = FrameSource::new(registry);
        source.start(&CameraSelector::Key(key)).unwrap();
        assert!(source.is_running());
        assert_eq!(source.frame_size(), Some((4, 4)));

        let store = source.store();
        let first = store.generation();
        assert!(wait_for(|| store.generation() > first + 2));

        let (raw, encoded) = store.latest().unwrap();
        assert_eq!(raw.size(), (4, 4));
        assert!(encoded.jpeg.starts_with(&[0xFF, 0xD8]));
        assert!(source.get_encoded_frame().is_some());
        assert!(source.get_frame_copy().is_some());

        source.stop();
        assert!(!source.is_running());
        assert!(source.get_frame_view().is_none());
        assert!(source.get_encoded_frame().is_none());

        // second stop is a no-op
        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn test_open_failure_lists_candidates() {
        let registry = registry(vec![SyntheticCamera::new("Held", two_frames())
            .with_behaviour(Behaviour::Busy)
            .with_interval(Duration::from_millis(1))]);

        let mut source = FrameSource::new(registry);
        let err = source.start(&CameraSelector::Index(0)).unwrap_err();
        match err {
            CaptureError::Open { target, attempts } => {
                assert_eq!(target, "fake-0");
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].backend, "fake");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!source.is_running());
    }

    #[test]
    fn test_unknown_key() {
        let registry = registry(vec![SyntheticCamera::new("Cam", two_frames())]);
        let mut source = FrameSource::new(registry);
        assert!(matches!(
            source.start(&CameraSelector::Key("nope".into())),
            Err(CaptureError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_size_change_is_adopted() {
        let frames = vec![Frame::solid(4, 4, [1, 1, 1]), Frame::solid(8, 2, [2, 2, 2])];
        let registry = registry(vec![
            SyntheticCamera::new("Switcher", frames).with_interval(Duration::from_millis(2))
        ]);

        let mut source = FrameSource::new(registry);
        source.start(&CameraSelector::Index(0)).unwrap();

        let stats = source.stats();
        assert!(wait_for(|| stats.size_changes.load(Ordering::Relaxed) >= 2));
        let seen = source.frame_size().unwrap();
        assert!(seen == (4, 4) || seen == (8, 2));
        source.stop();
    }

    /// Devices that log every read start and count how many are open
    struct StallingBackend {
        reads: Arc<Mutex<Vec<usize>>>,
        live: Arc<AtomicU64>,
    }

    struct StallingDevice {
        index: usize,
        delay: Duration,
        reads: Arc<Mutex<Vec<usize>>>,
        live: Arc<AtomicU64>,
    }

    impl CaptureBackend for StallingBackend {
        fn id(&self) -> &'static str {
            "stalling"
        }

        fn base_confidence(&self) -> i32 {
            100
        }

        fn enumerate(&self) -> Result<Vec<BackendDevice>, CaptureError> {
            Ok(vec![BackendDevice::new("Wedged", 0), BackendDevice::new("Quick", 1)])
        }

        fn open(&self, index: usize) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StallingDevice {
                index,
                delay: Duration::from_millis(if index == 0 { 200 } else { 10 }),
                reads: self.reads.clone(),
                live: self.live.clone(),
            }))
        }
    }

    impl CaptureDevice for StallingDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            self.reads.lock().push(self.index);
            thread::sleep(self.delay);
            Ok(Frame::solid(4, 4, [self.index as u8 * 100, 0, 0]))
        }

        fn describe(&self) -> String {
            format!("stalling #{}", self.index)
        }
    }

    impl Drop for StallingDevice {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_detached_thread_stays_stopped_after_restart() {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let live = Arc::new(AtomicU64::new(0));
        let backend: Arc<dyn CaptureBackend> = Arc::new(StallingBackend {
            reads: reads.clone(),
            live: live.clone(),
        });
        let registry = Arc::new(DeviceRegistry::new(
            vec![backend],
            CaptureConfig {
                stop_timeout_ms: 20,
                ..config()
            },
        ));

        let mut source = FrameSource::new(registry);
        source.start(&CameraSelector::Index(0)).unwrap();
        // let the capture thread enter a wedged read
        thread::sleep(Duration::from_millis(50));
        source.stop();
        assert!(!source.is_running());

        source.start(&CameraSelector::Index(1)).unwrap();
        reads.lock().clear();
        thread::sleep(Duration::from_millis(600));

        let after_restart = reads.lock().clone();
        assert!(after_restart.contains(&1));
        assert!(
            !after_restart.contains(&0),
            "old device kept reading: {:?}",
            after_restart
        );
        // the wedged device was released once its read returned
        assert!(wait_for(|| live.load(Ordering::SeqCst) == 1));
        assert!(source.is_running());

        let raw = source.get_frame_view().unwrap();
        assert_eq!(raw.pixel(0, 0).unwrap()[0], 100);

        source.stop();
        assert!(wait_for(|| live.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!("2".parse::<CameraSelector>().unwrap(), CameraSelector::Index(2));
        assert_eq!(
            "v4l2-mjpeg-link-usb".parse::<CameraSelector>().unwrap(),
            CameraSelector::Key("v4l2-mjpeg-link-usb".into())
        );
    }

    #[test]
    fn test_store_publish_is_paired() {
        let store = FrameStore::new();
        assert!(store.latest().is_none());

        let generation = store.publish(Frame::solid(1, 1, [0, 0, 0]), Bytes::from_static(b"x"));
        let (raw, encoded) = store.latest().unwrap();
        assert_eq!(raw.size(), (1, 1));
        assert_eq!(encoded.generation, generation);
        assert_eq!(store.latest_jpeg().unwrap().jpeg, Bytes::from_static(b"x"));
    }
}
