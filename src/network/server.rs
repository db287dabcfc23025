//! MJPEG HTTP server
//!
//! Serves `multipart/x-mixed-replace` on `/` and `/stream.mjpg`. Every
//! client gets its own body stream that polls the shared [`JpegFeed`] at the
//! target frame rate, so a slow client just sees fewer distinct frames.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver};
use futures_util::stream::{self, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::discovery::{Announcer, AnnouncerConfig};
use crate::capture::EncodedFrame;
use crate::config::ServerConfig;
use crate::error::NetworkError;
use crate::protocol::{part_header, MULTIPART_CONTENT_TYPE, STREAM_PATH};

/// Poll interval while no new frame is available
const IDLE_POLL: Duration = Duration::from_millis(10);

/// How long `stop()` waits for open connections to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Source of the latest encoded frame
pub trait JpegFeed: Send + Sync {
    fn latest_jpeg(&self) -> Option<EncodedFrame>;
}

#[derive(Clone)]
struct ServerState {
    feed: Arc<dyn JpegFeed>,
    interval: Duration,
    cancel: CancellationToken,
    clients: Arc<AtomicUsize>,
}

/// Decrements the client count when a response body is dropped
struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn new(clients: Arc<AtomicUsize>) -> Self {
        let now = clients.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Stream client connected ({} active)", now);
        Self(clients)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::info!("Stream client left ({} active)", now);
    }
}

struct ClientCursor {
    state: ServerState,
    last_generation: u64,
    last_sent: Option<Instant>,
    _guard: ClientGuard,
}

impl ClientCursor {
    /// Wait for pacing and a new generation, then build the next part
    async fn next_part(&mut self) -> Option<[Bytes; 3]> {
        if let Some(last) = self.last_sent {
            let remaining = self.state.interval.saturating_sub(last.elapsed());
            if !remaining.is_zero() && !self.pause(remaining).await {
                return None;
            }
        }

        loop {
            if self.state.cancel.is_cancelled() {
                return None;
            }
            match self.state.feed.latest_jpeg() {
                Some(frame) if frame.generation != self.last_generation => {
                    self.last_generation = frame.generation;
                    self.last_sent = Some(Instant::now());
                    return Some([
                        Bytes::from(part_header(frame.jpeg.len())),
                        frame.jpeg,
                        Bytes::from_static(b"\r\n"),
                    ]);
                }
                _ => {
                    if !self.pause(IDLE_POLL).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep unless the server is stopping; false means stop
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.state.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

async fn stream_handler(State(state): State<ServerState>) -> Response {
    let cursor = ClientCursor {
        _guard: ClientGuard::new(state.clients.clone()),
        state,
        last_generation: 0,
        last_sent: None,
    };

    let parts = stream::unfold(cursor, |mut cursor| async move {
        let part = cursor.next_part().await?;
        Some((part, cursor))
    })
    .flat_map(|part| stream::iter(part.into_iter().map(Ok::<Bytes, Infallible>)));

    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// HTTP server bound to one address, with an optional discovery announcer
pub struct StreamServer {
    config: ServerConfig,
    feed: Arc<dyn JpegFeed>,
    discovery_port: Option<u16>,
    runtime: Option<Runtime>,
    cancel: Option<CancellationToken>,
    done_rx: Option<Receiver<()>>,
    local_addr: Option<SocketAddr>,
    announcer: Option<Announcer>,
    clients: Arc<AtomicUsize>,
}

impl StreamServer {
    pub fn new(config: ServerConfig, feed: Arc<dyn JpegFeed>) -> Self {
        Self {
            config,
            feed,
            discovery_port: None,
            runtime: None,
            cancel: None,
            done_rx: None,
            local_addr: None,
            announcer: None,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer discovery requests on `port` while running
    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }

    /// Bind and start serving. Returns the bound address.
    pub fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let bind = format!("{}:{}", self.config.bind_host, self.config.port);
        let std_listener =
            std::net::TcpListener::bind(&bind).map_err(|source| NetworkError::BindFailed {
                addr: bind.clone(),
                source,
            })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mjpeg-server")
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(std_listener)?
        };

        let cancel = CancellationToken::new();
        let state = ServerState {
            feed: self.feed.clone(),
            interval: self.config.frame_interval(),
            cancel: cancel.clone(),
            clients: self.clients.clone(),
        };
        let app = Router::new()
            .route("/", get(stream_handler))
            .route(STREAM_PATH, get(stream_handler))
            .fallback(not_found)
            .with_state(state);

        let (done_tx, done_rx) = bounded::<()>(1);
        let shutdown = cancel.clone();
        runtime.spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("MJPEG server failed: {}", e);
            }
            let _ = done_tx.send(());
        });

        tracing::info!("MJPEG server listening on http://{}{}", local_addr, STREAM_PATH);

        if self.config.announce {
            if let Some(port) = self.discovery_port {
                let mut announcer = Announcer::new(AnnouncerConfig {
                    port,
                    stream_port: local_addr.port(),
                    name: self.config.name.clone(),
                    advertise_ip: None,
                });
                match announcer.start() {
                    Ok(_) => self.announcer = Some(announcer),
                    Err(e) => tracing::warn!("Discovery announcer unavailable: {}", e),
                }
            }
        }

        self.runtime = Some(runtime);
        self.cancel = Some(cancel);
        self.done_rx = Some(done_rx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop serving and release the port. Safe before `start` and when
    /// called twice.
    pub fn stop(&mut self) {
        if let Some(mut announcer) = self.announcer.take() {
            announcer.stop();
        }

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(rx) = self.done_rx.take() {
            if rx.recv_timeout(SHUTDOWN_GRACE).is_err() {
                tracing::warn!("MJPEG server did not shut down in time");
            }
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_millis(500));
        }

        if let Some(addr) = self.local_addr.take() {
            tracing::info!("MJPEG server on {} stopped", addr);
        }
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound address of the announcer, if one is running
    pub fn announcer_addr(&self) -> Option<SocketAddr> {
        self.announcer.as_ref().and_then(Announcer::local_addr)
    }

    /// Connected stream clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameStore};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn server_on_ephemeral_port(store: Arc<FrameStore>) -> StreamServer {
        let config = ServerConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
            announce: false,
            ..Default::default()
        };
        StreamServer::new(config, store)
    }

    /// Read until `until` shows up or the peer goes quiet
    fn get(addr: SocketAddr, path: &str, until: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while !String::from_utf8_lossy(&received).contains(until) {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&received).into_owned()
    }

    #[test]
    fn test_stop_without_start() {
        let mut server = server_on_ephemeral_port(Arc::new(FrameStore::new()));
        server.stop();
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_unknown_path_is_404() {
        let mut server = server_on_ephemeral_port(Arc::new(FrameStore::new()));
        let addr = server.start().unwrap();

        let response = get(addr, "/nope", "\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404"));
        server.stop();
    }

    #[test]
    fn test_stream_headers_and_part() {
        let store = Arc::new(FrameStore::new());
        store.publish(Frame::solid(1, 1, [0, 0, 0]), Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));

        let mut server = server_on_ephemeral_port(store);
        let addr = server.start().unwrap();

        let response = get(addr, STREAM_PATH, "Content-Length: 4\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(response.contains("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));

        server.stop();
        server.stop();
        assert!(server.local_addr().is_none());
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Fake JPEG whose third byte tags the frame
    fn tagged_jpeg(tag: u8, len: usize) -> Bytes {
        let mut jpeg = vec![0u8; len];
        jpeg[..3].copy_from_slice(&[0xFF, 0xD8, tag]);
        jpeg[len - 2..].copy_from_slice(&[0xFF, 0xD9]);
        Bytes::from(jpeg)
    }

    #[test]
    fn test_stalled_client_does_not_block_others() {
        use std::collections::HashSet;
        use std::sync::atomic::AtomicBool;

        let store = Arc::new(FrameStore::new());
        let feeding = Arc::new(AtomicBool::new(true));
        let feeder = {
            let store = store.clone();
            let feeding = feeding.clone();
            std::thread::spawn(move || {
                let mut tag = 0u8;
                while feeding.load(Ordering::SeqCst) {
                    tag = tag % 200 + 1;
                    store.publish(Frame::solid(1, 1, [tag, 0, 0]), tagged_jpeg(tag, 256 * 1024));
                    std::thread::sleep(Duration::from_millis(15));
                }
            })
        };

        let mut server = server_on_ephemeral_port(store);
        let addr = server.start().unwrap();

        // requests a stream and never reads it
        let mut stalled = TcpStream::connect(addr).unwrap();
        write!(stalled, "GET {} HTTP/1.1\r\nHost: test\r\n\r\n", STREAM_PATH).unwrap();
        assert!(wait_until(|| server.client_count() == 1));
        std::thread::sleep(Duration::from_millis(500));

        let mut active = TcpStream::connect(addr).unwrap();
        active
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        write!(active, "GET {} HTTP/1.1\r\nHost: test\r\n\r\n", STREAM_PATH).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut received = Vec::new();
        let mut scanned = 0;
        let mut tags = HashSet::new();
        let mut buf = [0u8; 64 * 1024];
        while tags.len() < 3 && Instant::now() < deadline {
            match active.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
            while scanned + 2 < received.len() {
                if received[scanned] == 0xFF && received[scanned + 1] == 0xD8 {
                    tags.insert(received[scanned + 2]);
                }
                scanned += 1;
            }
        }
        assert!(tags.len() >= 2, "active client saw {} distinct parts", tags.len());
        assert_eq!(server.client_count(), 2);

        drop(active);
        drop(stalled);
        assert!(wait_until(|| server.client_count() == 0));

        feeding.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
        server.stop();
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            bind_host: "127.0.0.1".into(),
            port: taken.local_addr().unwrap().port(),
            announce: false,
            ..Default::default()
        };
        let mut server = StreamServer::new(config, Arc::new(FrameStore::new()));
        assert!(matches!(server.start(), Err(NetworkError::BindFailed { .. })));
    }
}
