//! LAN discovery over UDP broadcast
//!
//! Senders run an [`Announcer`] that answers [`DISCOVERY_REQUEST`] with a
//! JSON [`DiscoveryResponse`]. Receivers use [`Discovery`] to broadcast the
//! request and collect answers for a fixed window.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::addr::local_ip;
use crate::config::DiscoveryConfig;
use crate::constants::{MAX_DISCOVERY_PACKET, SOCKET_POLL_INTERVAL};
use crate::error::{Error, NetworkError, Result};
use crate::protocol::{DiscoveredServer, DiscoveryResponse, DISCOVERY_REQUEST};

/// UDP socket with address reuse and broadcast enabled
fn broadcast_socket(bind: SocketAddr, read_timeout: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Announcer settings
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    /// UDP port to listen on
    pub port: u16,
    /// MJPEG server port to advertise
    pub stream_port: u16,
    pub name: String,
    /// Address to advertise; the default-route address when `None`
    pub advertise_ip: Option<IpAddr>,
}

/// Answers discovery requests on its own thread
pub struct Announcer {
    config: AnnouncerConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    answered: Arc<AtomicU64>,
}

impl Announcer {
    pub fn new(config: AnnouncerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            local_addr: None,
            answered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind and start answering. Returns the bound address.
    pub fn start(&mut self) -> std::result::Result<SocketAddr, NetworkError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let socket = broadcast_socket(bind, SOCKET_POLL_INTERVAL).map_err(|source| {
            NetworkError::BindFailed {
                addr: bind.to_string(),
                source,
            }
        })?;
        let local_addr = socket.local_addr()?;

        let ip = self.config.advertise_ip.unwrap_or_else(local_ip);
        let reply = serde_json::to_vec(&DiscoveryResponse::new(
            ip.to_string(),
            self.config.stream_port,
            self.config.name.clone(),
        ))
        .map_err(|e| NetworkError::Protocol(e.to_string()))?;

        let running = self.running.clone();
        let answered = self.answered.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("announcer".into())
            .spawn(move || {
                let mut buf = [0u8; MAX_DISCOVERY_PACKET];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, peer)) if &buf[..n] == DISCOVERY_REQUEST => {
                            match socket.send_to(&reply, peer) {
                                Ok(_) => {
                                    answered.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!("Answered discovery from {}", peer);
                                }
                                Err(e) => tracing::debug!("Reply to {} failed: {}", peer, e),
                            }
                        }
                        Ok((_, peer)) => tracing::trace!("Ignoring datagram from {}", peer),
                        Err(e) if is_timeout(&e) => {}
                        Err(e) => {
                            tracing::warn!("Announcer receive failed: {}", e);
                            thread::sleep(SOCKET_POLL_INTERVAL);
                        }
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::Io(e)
            })?;

        tracing::info!(
            "Announcing {}:{} as \"{}\" on UDP {}",
            ip,
            self.config.stream_port,
            self.config.name,
            local_addr.port()
        );

        self.thread_handle = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop answering; returns within one socket poll interval
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Requests answered so far
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One discovery round
#[derive(Debug, Clone)]
pub struct Discovery {
    targets: Vec<SocketAddr>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(targets: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    /// Broadcast on the limited-broadcast address
    pub fn broadcast(port: u16, timeout: Duration) -> Self {
        Self::new(
            vec![SocketAddr::from((Ipv4Addr::BROADCAST, port))],
            timeout,
        )
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        if config.targets.is_empty() {
            return Ok(Self::broadcast(config.port, config.timeout()));
        }

        let targets = config
            .targets
            .iter()
            .map(|t| {
                t.parse::<SocketAddr>()
                    .map_err(|e| Error::Config(format!("discovery target {}: {}", t, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(targets, config.timeout()))
    }

    /// Send the request and collect answers until the window closes.
    ///
    /// Results are de-duplicated by advertised IP and keep arrival order.
    /// Malformed or foreign datagrams are ignored.
    pub fn discover(&self) -> std::result::Result<Vec<DiscoveredServer>, NetworkError> {
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let socket = broadcast_socket(bind, SOCKET_POLL_INTERVAL)
            .map_err(|source| NetworkError::BindFailed {
                addr: bind.to_string(),
                source,
            })?;

        let mut sent = 0;
        for target in &self.targets {
            match socket.send_to(DISCOVERY_REQUEST, target) {
                Ok(_) => sent += 1,
                Err(e) => tracing::warn!("Discovery request to {} failed: {}", target, e),
            }
        }
        if sent == 0 {
            return Err(NetworkError::ConnectionFailed(
                "could not send discovery request".into(),
            ));
        }

        let deadline = Instant::now() + self.timeout;
        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        let mut buf = [0u8; MAX_DISCOVERY_PACKET];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining.min(SOCKET_POLL_INTERVAL)))?;

            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => match DiscoveryResponse::parse(&buf[..n]) {
                    Some(response) => {
                        if seen.insert(response.ip.clone()) {
                            tracing::debug!("Found {} via {}", response.name, peer);
                            servers.push(DiscoveredServer::from(response));
                        }
                    }
                    None => tracing::debug!("Ignoring foreign datagram from {}", peer),
                },
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    tracing::warn!("Discovery receive failed: {}", e);
                    break;
                }
            }
        }

        tracing::info!("Discovery found {} server(s)", servers.len());
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcer_answers_loopback_discovery() {
        let mut announcer = Announcer::new(AnnouncerConfig {
            port: 0,
            stream_port: 8123,
            name: "bench-pc".into(),
            advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        });
        let addr = announcer.start().unwrap();

        let discovery = Discovery::new(
            vec![SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))],
            Duration::from_millis(600),
        );
        let servers = discovery.discover().unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].port, 8123);
        assert_eq!(servers[0].ip, "127.0.0.1");
        assert_eq!(servers[0].name, "bench-pc");
        assert_eq!(announcer.answered(), 1);

        announcer.stop();
        announcer.stop();
        assert!(!announcer.is_running());
    }

    #[test]
    fn test_foreign_and_duplicate_replies_are_filtered() {
        let fake = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fake_addr = fake.local_addr().unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 64];
            if let Ok((_, peer)) = fake.recv_from(&mut buf) {
                let good = br#"{"type":"WEBCAMSHARE_SERVER","ip":"10.0.0.9","port":8000,"name":"a"}"#;
                let _ = fake.send_to(b"garbage", peer);
                let _ = fake.send_to(br#"{"type":"OTHER","ip":"10.0.0.8","port":1,"name":"b"}"#, peer);
                let _ = fake.send_to(good, peer);
                let _ = fake.send_to(good, peer);
            }
        });

        let servers = Discovery::new(vec![fake_addr], Duration::from_millis(500))
            .discover()
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].ip, "10.0.0.9");
    }

    #[test]
    fn test_targets_from_config() {
        let config = DiscoveryConfig {
            targets: vec!["127.0.0.1:9999".into()],
            ..Default::default()
        };
        assert!(Discovery::from_config(&config).is_ok());

        let bad = DiscoveryConfig {
            targets: vec!["not an address".into()],
            ..Default::default()
        };
        assert!(matches!(Discovery::from_config(&bad), Err(Error::Config(_))));

        let default = Discovery::from_config(&DiscoveryConfig::default()).unwrap();
        assert_eq!(default.targets[0].ip(), IpAddr::V4(Ipv4Addr::BROADCAST));
    }
}
