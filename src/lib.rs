//! # WebCam Share
//!
//! Share a physical webcam across the LAN as an MJPEG stream and re-inject
//! it on another machine as a virtual camera.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SENDER PC ─────────────────────────────────┐
//! │                                                                            │
//! │  ┌──────────────┐   ┌──────────────┐       ┌──────────────────────────┐    │
//! │  │ v4l2-mjpeg   │   │  v4l2-yuyv   │  ...  │ synthetic (test pattern) │    │
//! │  └──────┬───────┘   └──────┬───────┘       └────────────┬─────────────┘    │
//! │         └──────────────────┼────────────────────────────┘                  │
//! │                            ▼                                               │
//! │            ┌───────────────────────────────┐                               │
//! │            │ DeviceRegistry (capture)      │ merge + rank + probe          │
//! │            └───────────────┬───────────────┘                               │
//! │                            ▼                                               │
//! │            ┌───────────────────────────────┐                               │
//! │            │ FrameSource (capture thread)  │ read → JPEG → FrameStore      │
//! │            └───────────────┬───────────────┘                               │
//! │                            ▼                                               │
//! │            ┌───────────────────────────────┐    ┌───────────────────┐      │
//! │            │ StreamServer (axum, /stream)  │    │ Announcer (UDP)   │      │
//! │            └───────────────┬───────────────┘    └─────────▲─────────┘      │
//! └────────────────────────────┼──────────────────────────────┼────────────────┘
//!                              │ multipart/x-mixed-replace    │ discovery
//!                              ▼                              │ broadcast
//! ┌────────────────────────────┼──────────────────────────────┼────────────────┐
//! │            ┌───────────────┴───────────────┐    ┌─────────┴─────────┐      │
//! │            │ StreamClient + MjpegParser    │◄───│ Discovery (UDP)   │      │
//! │            └───────────────┬───────────────┘    └───────────────────┘      │
//! │                            ▼                                               │
//! │            ┌───────────────────────────────┐                               │
//! │            │ ReceiverSession               │ lazy start, reconfigure       │
//! │            └───────────────┬───────────────┘                               │
//! │                            ▼                                               │
//! │            ┌───────────────────────────────┐                               │
//! │            │ VirtualCamera                 │ custom driver → fallback      │
//! │            └───────────────────────────────┘                               │
//! └──────────────────────────────── RECEIVER PC ───────────────────────────────┘
//! ```

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod virtualcam;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default TCP port for the MJPEG server
    pub const DEFAULT_STREAM_PORT: u16 = 8000;

    /// Default UDP port for discovery
    pub const DEFAULT_DISCOVERY_PORT: u16 = 8001;

    /// Default frame rate served to each client
    pub const DEFAULT_TARGET_FPS: u32 = 30;

    /// Default JPEG quality (1-100)
    pub const DEFAULT_JPEG_QUALITY: u8 = 80;

    /// Hard cap on the client accumulation buffer
    pub const MAX_CLIENT_BUFFER: usize = 1024 * 1024;

    /// Default window for collecting discovery responses
    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

    /// Default virtual camera frame rate
    pub const DEFAULT_VIRTUAL_CAMERA_FPS: u32 = 30;

    /// Receive timeout used by every UDP loop so stop requests are observed
    pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Maximum UDP datagram we expect for discovery traffic
    pub const MAX_DISCOVERY_PACKET: usize = 1472; // MTU - IP/UDP headers
}
