//! Receiver orchestration
//!
//! `connect` hands the connection to a worker thread named
//! `receiver-session`. The worker opens the stream, feeds every decoded
//! frame to the preview slot and the virtual camera, and reconnects a
//! bounded number of times when the stream drops.
//!
//! The virtual camera is created lazily from the first frame's size and is
//! reconfigured whenever the incoming size changes. Sink failures back off
//! without touching the connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::state::{ConnectionState, Status, StatusCell};
use crate::capture::Frame;
use crate::config::{AppConfig, ReceiverConfig, VirtualCameraConfig};
use crate::error::{Result, SessionError};
use crate::network::{ClientStopHandle, Discovery, StreamClient, StreamEnd};
use crate::protocol::{stream_url, DiscoveredServer};
use crate::virtualcam::{platform_drivers, DriverSet, SessionInfo, VirtualCamera};

/// Builds a fresh driver set for every virtual camera the session creates
pub type DriverFactory = Arc<dyn Fn() -> DriverSet + Send + Sync>;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Full stream URL
    Url(String),
    /// Host or IP on the configured stream port
    Host(String),
    Server(DiscoveredServer),
}

impl ConnectTarget {
    /// Stream URL for this target
    pub fn url(&self, default_port: u16) -> std::result::Result<String, SessionError> {
        match self {
            ConnectTarget::Url(url) => {
                let url = url.trim();
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(url.to_string())
                } else {
                    Err(SessionError::InvalidTarget(format!("not an http URL: {}", url)))
                }
            }
            ConnectTarget::Host(host) => {
                let host = host.trim();
                if host.is_empty() || host.contains(char::is_whitespace) {
                    return Err(SessionError::InvalidTarget(format!("bad host: {:?}", host)));
                }
                Ok(stream_url(host, default_port))
            }
            ConnectTarget::Server(server) => Ok(server.stream_url()),
        }
    }
}

struct Shared {
    cancel: Arc<AtomicBool>,
    client: Option<ClientStopHandle>,
    url: Option<String>,
}

pub struct ReceiverSession {
    config: AppConfig,
    drivers: DriverFactory,
    status: Arc<StatusCell<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    servers: Mutex<Vec<DiscoveredServer>>,
    selected: Mutex<Option<DiscoveredServer>>,
    preview: Arc<Mutex<Option<Arc<Frame>>>>,
    sink_info: Arc<Mutex<Option<SessionInfo>>>,
}

impl ReceiverSession {
    /// Session using this platform's virtual camera drivers
    pub fn new(config: AppConfig) -> Self {
        let vcam = config.virtual_camera.clone();
        Self::with_drivers(config, Arc::new(move || platform_drivers(&vcam)))
    }

    pub fn with_drivers(config: AppConfig, drivers: DriverFactory) -> Self {
        Self {
            config,
            drivers,
            status: Arc::new(StatusCell::new(ConnectionState::Disconnected, "Not connected")),
            shared: Arc::new(Mutex::new(Shared {
                cancel: Arc::new(AtomicBool::new(false)),
                client: None,
                url: None,
            })),
            worker: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
            preview: Arc::new(Mutex::new(None)),
            sink_info: Arc::new(Mutex::new(None)),
        }
    }

    /// Run one discovery round and remember the result
    pub fn discover(&self) -> Result<Vec<DiscoveredServer>> {
        let servers = Discovery::from_config(&self.config.discovery)?.discover()?;
        *self.servers.lock() = servers.clone();
        Ok(servers)
    }

    /// Servers found by the last discovery round
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        self.servers.lock().clone()
    }

    /// Start connecting in the background
    pub fn connect(&self, target: ConnectTarget) -> std::result::Result<(), SessionError> {
        let url = target.url(self.config.server.port)?;
        if !self.status.transition(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            format!("Connecting to {}...", url),
        ) {
            return Err(SessionError::AlreadyRunning);
        }

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        *self.preview.lock() = None;

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut shared = self.shared.lock();
            shared.cancel = cancel.clone();
            shared.client = None;
            shared.url = Some(url.clone());
        }

        let worker = Worker {
            url,
            config: self.config.clone(),
            cancel,
            status: self.status.clone(),
            shared: self.shared.clone(),
            preview: self.preview.clone(),
            sink: SinkPump::new(
                self.config.virtual_camera.clone(),
                &self.config.receiver,
                self.drivers.clone(),
                self.sink_info.clone(),
            ),
        };

        let handle = thread::Builder::new()
            .name("receiver-session".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.lock().url = None;
                self.status
                    .set(ConnectionState::Disconnected, format!("Could not connect: {}", e));
                SessionError::Worker(e.to_string())
            })?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Drop the connection and the virtual camera. Safe in any state.
    pub fn disconnect(&self) {
        let client = {
            let mut shared = self.shared.lock();
            shared.cancel.store(true, Ordering::SeqCst);
            shared.url = None;
            if self.status.state() != ConnectionState::Disconnected {
                self.status.set(ConnectionState::Disconnected, "Disconnected");
            }
            shared.client.take()
        };
        if let Some(client) = client {
            client.stop();
        }

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Receiver worker panicked");
            }
        }
    }

    /// Pick a server; reconnects if currently attached to a different one.
    ///
    /// Returns whether a (re)connect was started.
    pub fn select_server(
        &self,
        server: DiscoveredServer,
    ) -> std::result::Result<bool, SessionError> {
        *self.selected.lock() = Some(server.clone());

        if self.status.state() == ConnectionState::Disconnected {
            return Ok(false);
        }
        if self.current_url().as_deref() == Some(server.stream_url().as_str()) {
            return Ok(false);
        }

        tracing::info!("Switching to {}", server.display_label());
        self.disconnect();
        self.connect(ConnectTarget::Server(server))?;
        Ok(true)
    }

    pub fn selected_server(&self) -> Option<DiscoveredServer> {
        self.selected.lock().clone()
    }

    pub fn current_url(&self) -> Option<String> {
        self.shared.lock().url.clone()
    }

    pub fn status(&self) -> Status<ConnectionState> {
        self.status.snapshot()
    }

    /// Most recent decoded frame
    pub fn latest_preview(&self) -> Option<Arc<Frame>> {
        self.preview.lock().clone()
    }

    /// Running virtual camera session, if any
    pub fn sink_session(&self) -> Option<SessionInfo> {
        self.sink_info.lock().clone()
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Owns the virtual camera on the worker thread
struct SinkPump {
    camera: Option<VirtualCamera>,
    config: VirtualCameraConfig,
    drivers: DriverFactory,
    info: Arc<Mutex<Option<SessionInfo>>>,
    base_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl SinkPump {
    fn new(
        config: VirtualCameraConfig,
        receiver: &ReceiverConfig,
        drivers: DriverFactory,
        info: Arc<Mutex<Option<SessionInfo>>>,
    ) -> Self {
        Self {
            camera: None,
            config,
            drivers,
            info,
            base_backoff: receiver.sink_backoff(),
            max_backoff: receiver.sink_backoff_max(),
            backoff: receiver.sink_backoff(),
            retry_at: None,
        }
    }

    fn deliver(&mut self, frame: &Frame) {
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return;
        }

        let (width, height) = frame.size();
        let ready = match self.camera.as_mut() {
            None => {
                let mut camera =
                    VirtualCamera::new(&self.config, width, height, (self.drivers)());
                let started = camera.start();
                self.camera = Some(camera);
                started.map(|report| tracing::info!("{}", report.message))
            }
            Some(camera) => {
                let format = camera.format();
                if !camera.is_started() || (format.width, format.height) != (width, height) {
                    camera.reconfigure(width, height).map(|_| ())
                } else {
                    Ok(())
                }
            }
        };

        let delivered = match (ready, self.camera.as_mut()) {
            (Ok(()), Some(camera)) => camera.send_frame(frame),
            (Err(e), _) => {
                tracing::warn!("Virtual camera unavailable: {}", e);
                false
            }
            (Ok(()), None) => false,
        };

        if delivered {
            self.backoff = self.base_backoff;
            self.retry_at = None;
        } else {
            tracing::debug!("Sink retry in {:?}", self.backoff);
            self.retry_at = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(self.max_backoff);
        }
        *self.info.lock() = self.camera.as_ref().and_then(VirtualCamera::session);
    }

    fn shutdown(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
        *self.info.lock() = None;
    }
}

struct Worker {
    url: String,
    config: AppConfig,
    cancel: Arc<AtomicBool>,
    status: Arc<StatusCell<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    preview: Arc<Mutex<Option<Arc<Frame>>>>,
    sink: SinkPump,
}

impl Worker {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Publish unless a disconnect already claimed the status
    fn publish(&self, state: ConnectionState, message: impl Into<String>) -> bool {
        let _shared = self.shared.lock();
        if self.cancelled() {
            return false;
        }
        self.status.set(state, message);
        true
    }

    /// End the session from the worker side
    fn finish(&self, message: String) {
        let mut shared = self.shared.lock();
        if self.cancelled() {
            return;
        }
        shared.url = None;
        self.status.set(ConnectionState::Disconnected, message);
    }

    /// Open a client and register its stop handle with the session
    fn open(&self) -> std::result::Result<StreamClient, String> {
        let mut client = StreamClient::new(self.url.clone(), self.config.client.clone());
        {
            let mut shared = self.shared.lock();
            if self.cancelled() {
                return Err("cancelled".into());
            }
            shared.client = Some(client.stop_handle());
        }
        client.start().map_err(|e| e.to_string())?;
        Ok(client)
    }

    fn run(mut self) {
        let policy = self.config.receiver.clone();
        let mut attempts_left = policy.reconnect_attempts;
        let mut backoff = policy.reconnect_backoff();
        let mut connected_once = false;

        while !self.cancelled() {
            let end = match self.open() {
                Ok(mut client) => {
                    if !self.publish(ConnectionState::Connected, format!("Connected to {}", self.url))
                    {
                        break;
                    }
                    connected_once = true;
                    attempts_left = policy.reconnect_attempts;
                    backoff = policy.reconnect_backoff();
                    self.pump(&mut client)
                }
                Err(e) if !connected_once => {
                    self.finish(format!("Connection failed: {}", e));
                    break;
                }
                Err(e) => StreamEnd::Error(e),
            };

            if self.cancelled() {
                break;
            }
            let reason = match &end {
                StreamEnd::Eof => "server closed the stream".to_string(),
                StreamEnd::Error(e) => e.clone(),
                StreamEnd::Stopped => "stopped".to_string(),
            };
            if attempts_left == 0 {
                self.finish(format!("Stream ended: {}", reason));
                break;
            }

            attempts_left -= 1;
            self.publish(
                ConnectionState::Connecting,
                format!(
                    "Stream lost ({}), reconnecting ({}/{})...",
                    reason,
                    policy.reconnect_attempts - attempts_left,
                    policy.reconnect_attempts
                ),
            );
            if !self.sleep(backoff) {
                break;
            }
            backoff *= 2;
        }

        self.sink.shutdown();
        self.shared.lock().client = None;
        tracing::debug!("Receiver worker for {} exited", self.url);
    }

    /// Feed frames until the stream ends
    fn pump(&mut self, client: &mut StreamClient) -> StreamEnd {
        while let Some(frame) = client.next_frame() {
            if self.cancelled() {
                break;
            }
            let frame = Arc::new(frame);
            *self.preview.lock() = Some(frame.clone());
            self.sink.deliver(&frame);
        }
        let end = client.end_reason().cloned().unwrap_or(StreamEnd::Stopped);
        client.stop();
        end
    }

    /// Sleep in small steps; false if cancelled meanwhile
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.cancelled() {
                return false;
            }
            thread::sleep(Duration::from_millis(20).min(duration));
        }
        !self.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameStore;
    use crate::codec::JpegEncoder;
    use crate::config::ServerConfig;
    use crate::network::StreamServer;
    use crate::virtualcam::driver::DriverStatusCode;
    use crate::virtualcam::sink::tests::{status, MockBackend, MockLog};
    use crate::virtualcam::DriverKind;

    /// Publishes alternating frames of a given size into a store
    struct Feeder {
        store: Arc<FrameStore>,
        size: Arc<Mutex<(u32, u32)>>,
        running: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl Feeder {
        fn start(width: u32, height: u32) -> Self {
            let store = Arc::new(FrameStore::new());
            let size = Arc::new(Mutex::new((width, height)));
            let running = Arc::new(AtomicBool::new(true));
            let handle = {
                let (store, size, running) = (store.clone(), size.clone(), running.clone());
                thread::spawn(move || {
                    let mut encoder = JpegEncoder::new(80).unwrap();
                    let mut shade = 0u8;
                    while running.load(Ordering::SeqCst) {
                        let (w, h) = *size.lock();
                        shade = shade.wrapping_add(40);
                        let frame = Frame::solid(w, h, [shade, 0, 0]);
                        let jpeg = encoder.encode(&frame).unwrap();
                        store.publish(frame, jpeg);
                        thread::sleep(Duration::from_millis(20));
                    }
                })
            };
            Self {
                store,
                size,
                running,
                handle: Some(handle),
            }
        }
    }

    impl Drop for Feeder {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn server(store: Arc<FrameStore>) -> StreamServer {
        let mut server = StreamServer::new(
            ServerConfig {
                bind_host: "127.0.0.1".into(),
                port: 0,
                announce: false,
                ..Default::default()
            },
            store,
        );
        server.start().unwrap();
        server
    }

    fn mock_drivers() -> (DriverFactory, Arc<Mutex<MockLog>>) {
        let log = Arc::new(Mutex::new(MockLog::default()));
        let shared = log.clone();
        let factory: DriverFactory = Arc::new(move || DriverSet {
            diagnose: Box::new(|| status(DriverStatusCode::NotRegistered)),
            custom: None,
            fallback: Some(Box::new(MockBackend::with_log(
                DriverKind::Fallback,
                false,
                shared.clone(),
            ))),
        });
        (factory, log)
    }

    fn session(drivers: DriverFactory) -> ReceiverSession {
        let mut config = AppConfig::default();
        config.receiver.reconnect_attempts = 1;
        config.receiver.reconnect_backoff_ms = 50;
        ReceiverSession::with_drivers(config, drivers)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn url_of(server: &StreamServer) -> ConnectTarget {
        ConnectTarget::Url(format!("http://{}/stream.mjpg", server.local_addr().unwrap()))
    }

    #[test]
    fn test_target_urls() {
        assert_eq!(
            ConnectTarget::Host("10.0.0.5".into()).url(8000).unwrap(),
            "http://10.0.0.5:8000/stream.mjpg"
        );
        assert!(ConnectTarget::Host(" ".into()).url(8000).is_err());
        assert!(ConnectTarget::Url("ftp://x".into()).url(8000).is_err());
        let server = DiscoveredServer {
            ip: "10.0.0.7".into(),
            port: 9000,
            name: "desk".into(),
        };
        assert_eq!(
            ConnectTarget::Server(server).url(8000).unwrap(),
            "http://10.0.0.7:9000/stream.mjpg"
        );
    }

    #[test]
    fn test_sink_sized_from_first_frame_and_reconfigured() {
        let feeder = Feeder::start(4, 4);
        let server = server(feeder.store.clone());
        let (drivers, log) = mock_drivers();
        let session = session(drivers);

        session.connect(url_of(&server)).unwrap();
        assert!(wait_until(|| session
            .sink_session()
            .is_some_and(|s| s.frames_sent > 0)));
        assert_eq!(session.status().state, ConnectionState::Connected);
        let first = session.sink_session().unwrap();
        assert_eq!((first.format.width, first.format.height), (4, 4));
        assert_eq!(session.latest_preview().unwrap().size(), (4, 4));

        *feeder.size.lock() = (8, 6);
        assert!(wait_until(|| session
            .sink_session()
            .is_some_and(|s| (s.format.width, s.format.height) == (8, 6))));
        assert!(session.sink_session().unwrap().session_id > first.session_id);

        session.disconnect();
        assert_eq!(session.status().state, ConnectionState::Disconnected);
        assert!(session.sink_session().is_none());
        let log = log.lock();
        assert_eq!(log.opens.len(), log.closes);
    }

    #[test]
    fn test_second_connect_is_rejected() {
        let feeder = Feeder::start(4, 4);
        let server = server(feeder.store.clone());
        let (drivers, _) = mock_drivers();
        let session = session(drivers);

        session.connect(url_of(&server)).unwrap();
        assert!(matches!(
            session.connect(url_of(&server)),
            Err(SessionError::AlreadyRunning)
        ));
        session.disconnect();
        session.disconnect();
        assert_eq!(session.status().state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_refused_connection_is_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (drivers, _) = mock_drivers();
        let session = session(drivers);

        session
            .connect(ConnectTarget::Url(format!("http://127.0.0.1:{}/stream.mjpg", port)))
            .unwrap();
        assert!(wait_until(|| session.status().state == ConnectionState::Disconnected));
        assert!(session.status().message.starts_with("Connection failed"));
        assert_eq!(session.current_url(), None);
    }

    #[test]
    fn test_server_loss_exhausts_reconnects() {
        let feeder = Feeder::start(4, 4);
        let mut server = server(feeder.store.clone());
        let (drivers, _) = mock_drivers();
        let session = session(drivers);

        session.connect(url_of(&server)).unwrap();
        assert!(wait_until(|| session.latest_preview().is_some()));
        assert!(session.current_url().is_some());

        server.stop();
        assert!(wait_until(|| session.status().state == ConnectionState::Disconnected));
        assert!(session.status().message.starts_with("Stream ended"));
        assert_eq!(session.current_url(), None);
        assert!(session.sink_session().is_none());
    }

    #[test]
    fn test_select_server_while_disconnected_only_records() {
        let (drivers, _) = mock_drivers();
        let session = session(drivers);
        let server = DiscoveredServer {
            ip: "10.0.0.7".into(),
            port: 9000,
            name: "desk".into(),
        };
        assert!(!session.select_server(server.clone()).unwrap());
        assert_eq!(session.selected_server(), Some(server));
        assert_eq!(session.status().state, ConnectionState::Disconnected);
    }
}
