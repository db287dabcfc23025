//! Sender orchestration
//!
//! Opens the camera and binds the server on a worker thread so `start`
//! returns at once. The worker parks its result in shared state under the
//! same lock `stop` uses, so a stop that lands mid-start tears down whatever
//! the worker finishes opening.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::state::{Status, StatusCell, StreamingState};
use crate::capture::{ActiveCamera, CameraSelector, DeviceRegistry, Frame, FrameSource};
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::network::{local_ip, StreamServer};
use crate::protocol::stream_url;

struct Running {
    source: FrameSource,
    server: StreamServer,
}

#[derive(Default)]
struct Shared {
    running: Option<Running>,
    cancel: bool,
}

pub struct SenderSession {
    registry: Arc<DeviceRegistry>,
    config: AppConfig,
    status: Arc<StatusCell<StreamingState>>,
    shared: Arc<Mutex<Shared>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SenderSession {
    pub fn new(registry: Arc<DeviceRegistry>, config: AppConfig) -> Self {
        Self {
            registry,
            config,
            status: Arc::new(StatusCell::new(StreamingState::Stopped, "Idle")),
            shared: Arc::new(Mutex::new(Shared::default())),
            worker: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Begin streaming `selector` in the background
    pub fn start(&self, selector: CameraSelector) -> Result<(), SessionError> {
        if !self.status.transition(
            StreamingState::Stopped,
            StreamingState::Starting,
            format!("Opening {}...", selector),
        ) {
            return Err(SessionError::AlreadyRunning);
        }
        self.reap_worker();
        self.shared.lock().cancel = false;

        let registry = self.registry.clone();
        let config = self.config.clone();
        let status = self.status.clone();
        let shared = self.shared.clone();

        let handle = thread::Builder::new()
            .name("sender-start".into())
            .spawn(move || {
                let outcome = open_pipeline(registry, &config, &selector);

                let mut guard = shared.lock();
                match outcome {
                    Ok(mut running) if guard.cancel => {
                        drop(guard);
                        running.server.stop();
                        running.source.stop();
                        status.set(StreamingState::Stopped, "Stopped");
                    }
                    Ok(running) => {
                        let message = match running.server.local_addr() {
                            Some(addr) => format!("Streaming at {}", url_for(addr)),
                            None => "Streaming".to_string(),
                        };
                        guard.running = Some(running);
                        status.set(StreamingState::Started, message);
                    }
                    Err(message) => {
                        drop(guard);
                        tracing::error!("{}", message);
                        status.set(StreamingState::Stopped, message);
                    }
                }
            })
            .map_err(|e| {
                self.status
                    .set(StreamingState::Stopped, format!("Could not start: {}", e));
                SessionError::Worker(e.to_string())
            })?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stop streaming. Safe to call in any state.
    pub fn stop(&self) {
        let running = {
            let mut shared = self.shared.lock();
            shared.cancel = true;
            shared.running.take()
        };

        match running {
            Some(mut running) => {
                self.status.set(StreamingState::Stopping, "Stopping...");
                running.server.stop();
                running.source.stop();
                self.status.set(StreamingState::Stopped, "Stopped");
            }
            None if self.status.state() == StreamingState::Starting => {
                self.status.note("Stop requested while starting");
            }
            None => {}
        }
        self.reap_worker();
    }

    /// Join a worker that has already finished
    fn reap_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn status(&self) -> Status<StreamingState> {
        self.status.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running.is_some()
    }

    /// URL receivers should open
    pub fn stream_url(&self) -> Option<String> {
        let shared = self.shared.lock();
        let addr = shared.running.as_ref()?.server.local_addr()?;
        Some(url_for(addr))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().running.as_ref()?.server.local_addr()
    }

    pub fn active_camera(&self) -> Option<ActiveCamera> {
        self.shared.lock().running.as_ref()?.source.active_camera().cloned()
    }

    /// Most recent captured frame
    pub fn latest_preview(&self) -> Option<Arc<Frame>> {
        self.shared.lock().running.as_ref()?.source.get_frame_view()
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .lock()
            .running
            .as_ref()
            .map_or(0, |r| r.server.client_count())
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // the worker may have finished opening after the first stop
        self.stop();
    }
}

fn url_for(addr: SocketAddr) -> String {
    let host = if addr.ip().is_unspecified() {
        local_ip()
    } else {
        addr.ip()
    };
    stream_url(&host.to_string(), addr.port())
}

fn open_pipeline(
    registry: Arc<DeviceRegistry>,
    config: &AppConfig,
    selector: &CameraSelector,
) -> Result<Running, String> {
    let mut source = FrameSource::new(registry);
    source
        .start(selector)
        .map_err(|e| format!("Could not open camera: {}", e))?;

    let mut server = StreamServer::new(config.server.clone(), source.store())
        .with_discovery_port(config.discovery.port);
    if let Err(e) = server.start() {
        source.stop();
        return Err(format!("Could not start server: {}", e));
    }

    Ok(Running { source, server })
}
