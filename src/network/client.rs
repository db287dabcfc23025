//! MJPEG stream client
//!
//! Blocking facade over an async HTTP body. Each client owns a small
//! current-thread runtime that only runs while a call is waiting for data.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::parser::MjpegParser;
use crate::capture::Frame;
use crate::codec::JpegDecoder;
use crate::config::ClientConfig;
use crate::error::NetworkError;

/// Why the frame sequence ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// `stop()` was called
    Stopped,
    /// The server closed the body
    Eof,
    /// The transport failed mid-stream
    Error(String),
}

/// Client counters
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub bytes_received: u64,
    pub frames_extracted: u64,
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub cap_trims: u64,
}

/// Cloneable handle that interrupts a client from another thread
#[derive(Clone)]
pub struct ClientStopHandle {
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ClientStopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One connection to a remote MJPEG endpoint
pub struct StreamClient {
    url: String,
    config: ClientConfig,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    runtime: Option<Runtime>,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MjpegParser,
    decoder: JpegDecoder,
    end: Option<StreamEnd>,
}

impl StreamClient {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        let parser = MjpegParser::new(config.buffer_cap);
        Self {
            url: url.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            runtime: None,
            body: None,
            parser,
            decoder: JpegDecoder::new(),
            end: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Handle that can stop this client while it is blocked
    pub fn stop_handle(&self) -> ClientStopHandle {
        ClientStopHandle {
            running: self.running.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Open the stream. Fails unless the server answers `200 OK`.
    ///
    /// A client is single-use: once stopped it cannot be started again.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self.cancel.is_cancelled() {
            return Err(NetworkError::Closed);
        }
        if self.body.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let http = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout())
            .build()
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let cancel = self.cancel.clone();
        let timeout = self.config.connect_timeout();
        let request = http.get(&self.url).send();
        let response = runtime.block_on(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(NetworkError::Closed),
                result = tokio::time::timeout(timeout, request) => match result {
                    Err(_) => Err(NetworkError::Timeout),
                    Ok(Err(e)) => Err(NetworkError::ConnectionFailed(e.to_string())),
                    Ok(Ok(response)) => Ok(response),
                },
            }
        })?;

        if response.status() != StatusCode::OK {
            return Err(NetworkError::BadStatus {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        tracing::info!("Connected to {}", self.url);
        self.body = Some(response.bytes_stream().boxed());
        self.runtime = Some(runtime);
        self.end = None;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the next decodable frame.
    ///
    /// Returns `None` once the client is stopped or the stream ends; see
    /// [`end_reason`](Self::end_reason). Undecodable payloads are skipped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                if self.cancel.is_cancelled() && self.end.is_none() {
                    self.end = Some(StreamEnd::Stopped);
                }
                return None;
            }

            while let Some(jpeg) = self.parser.next_jpeg() {
                match self.decoder.decode(&jpeg) {
                    Ok(frame) => return Some(frame),
                    Err(e) => tracing::debug!("Skipping undecodable frame: {}", e),
                }
            }

            let (Some(runtime), Some(body)) = (self.runtime.as_ref(), self.body.as_mut()) else {
                return None;
            };
            let cancel = self.cancel.clone();
            let next = runtime.block_on(async {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = body.next() => Some(chunk),
                }
            });

            match next {
                None => {
                    self.end = Some(StreamEnd::Stopped);
                    return None;
                }
                Some(None) => {
                    tracing::info!("Stream from {} ended", self.url);
                    self.finish(StreamEnd::Eof);
                    return None;
                }
                Some(Some(Err(e))) => {
                    tracing::warn!("Stream from {} failed: {}", self.url, e);
                    self.finish(StreamEnd::Error(e.to_string()));
                    return None;
                }
                Some(Some(Ok(chunk))) => self.parser.push(&chunk),
            }
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        self.running.store(false, Ordering::SeqCst);
        self.body = None;
        self.end = Some(end);
    }

    /// Iterator over decoded frames; ends when [`next_frame`](Self::next_frame) does
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { client: self }
    }

    /// Close the connection. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_handle().stop();
        self.body = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            tracing::debug!("Disconnected from {}", self.url);
        }
        if self.end.is_none() {
            self.end = Some(StreamEnd::Stopped);
        }
        self.parser.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set once the frame sequence has ended
    pub fn end_reason(&self) -> Option<&StreamEnd> {
        self.end.as_ref()
    }

    pub fn stats(&self) -> ClientStats {
        let parser = self.parser.stats();
        let decoder = self.decoder.stats();
        ClientStats {
            bytes_received: parser.bytes_in,
            frames_extracted: parser.frames_out,
            frames_decoded: decoder.frames_decoded,
            decode_failures: decoder.decode_failures,
            cap_trims: parser.cap_trims,
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Borrowing iterator returned by [`StreamClient::frames`]
pub struct Frames<'a> {
    client: &'a mut StreamClient,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.client.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// One-shot HTTP server writing `response` verbatim
    fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(&response);
            }
        });
        format!("http://{}/stream.mjpg", addr)
    }

    #[test]
    fn test_non_200_is_connection_error() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec());
        let mut client = StreamClient::new(url, ClientConfig::default());
        assert!(matches!(
            client.start(),
            Err(NetworkError::BadStatus { status: 404, .. })
        ));
    }

    #[test]
    fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = StreamClient::new(format!("http://{}/", addr), ClientConfig::default());
        assert!(client.start().is_err());
    }

    #[test]
    fn test_frames_then_eof() {
        let mut encoder = crate::codec::JpegEncoder::new(80).unwrap();
        let jpeg = encoder.encode(&Frame::solid(4, 4, [9, 9, 9])).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&jpeg);
        // undecodable payload between two good frames
        body.extend_from_slice(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
        body.extend_from_slice(&jpeg);

        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);

        let mut client = StreamClient::new(serve_once(response), ClientConfig::default());
        client.start().unwrap();

        let frames: Vec<Frame> = client.frames().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.size() == (4, 4)));
        assert_eq!(client.end_reason(), Some(&StreamEnd::Eof));
        assert_eq!(client.stats().decode_failures, 1);

        client.stop();
        client.stop();
        assert!(!client.is_running());
        assert!(matches!(client.start(), Err(NetworkError::Closed)));
    }

    #[test]
    fn test_stop_handle_interrupts_blocked_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nTransfer-Encoding: chunked\r\n\r\n",
                );
                let _ = stream.flush();
                // hold the connection open without sending frames
                thread::sleep(std::time::Duration::from_secs(5));
            }
        });

        let mut client = StreamClient::new(format!("http://{}/", addr), ClientConfig::default());
        client.start().unwrap();

        let handle = client.stop_handle();
        thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(100));
            handle.stop();
        });

        assert!(client.next_frame().is_none());
        assert_eq!(client.end_reason(), Some(&StreamEnd::Stopped));
    }
}
