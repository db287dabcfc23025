//! Wire formats shared by sender and receiver
//!
//! - HTTP: `GET /stream.mjpg` (or `/`) answers `multipart/x-mixed-replace`
//!   with one `--frame` part per JPEG.
//! - UDP discovery: the receiver broadcasts [`DISCOVERY_REQUEST`], every
//!   sender answers with a JSON [`DiscoveryResponse`].

use serde::{Deserialize, Serialize};

/// Path of the MJPEG endpoint
pub const STREAM_PATH: &str = "/stream.mjpg";

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Content type of the streaming response
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Literal discovery request payload
pub const DISCOVERY_REQUEST: &[u8] = b"WEBCAMSHARE_DISCOVER";

/// Message-type tag carried by every discovery response
pub const DISCOVERY_RESPONSE_TYPE: &str = "WEBCAMSHARE_SERVER";

/// Build the header block that precedes one JPEG in the multipart body
pub fn part_header(content_length: usize) -> String {
    format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, content_length
    )
}

/// Build the stream URL for a sender
pub fn stream_url(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, STREAM_PATH)
}

/// JSON body of a discovery reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: String,
    pub port: u16,
    pub name: String,
}

impl DiscoveryResponse {
    pub fn new(ip: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            kind: DISCOVERY_RESPONSE_TYPE.to_string(),
            ip: ip.into(),
            port,
            name: name.into(),
        }
    }

    /// Parse a datagram, rejecting non-JSON bodies and foreign tags
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let response: DiscoveryResponse = serde_json::from_slice(payload).ok()?;
        if response.kind != DISCOVERY_RESPONSE_TYPE {
            return None;
        }
        Some(response)
    }
}

/// A sender found on the LAN
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredServer {
    pub ip: String,
    pub port: u16,
    pub name: String,
}

impl DiscoveredServer {
    pub fn stream_url(&self) -> String {
        stream_url(&self.ip, self.port)
    }

    /// Label shown in server pickers
    pub fn display_label(&self) -> String {
        format!("{} - {}:{}", self.name, self.ip, self.port)
    }
}

impl From<DiscoveryResponse> for DiscoveredServer {
    fn from(response: DiscoveryResponse) -> Self {
        Self {
            ip: response.ip,
            port: response.port,
            name: response.name,
        }
    }
}
