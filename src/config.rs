//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every field
//! has a default so partial files are accepted.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub virtual_camera: VirtualCameraConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,
}

/// Camera enumeration and capture loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// JPEG quality used by the capture thread (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Upper bound for opening a single candidate
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Reads attempted before a freshly opened device is declared busy
    #[serde(default = "default_probe_read_attempts")]
    pub probe_read_attempts: u32,

    /// Sleep between probe reads
    #[serde(default = "default_probe_read_interval_ms")]
    pub probe_read_interval_ms: u64,

    /// Sleep after a failed read in the capture loop
    #[serde(default = "default_read_retry_ms")]
    pub read_retry_ms: u64,

    /// Low-index slots tried when enumeration reports nothing
    #[serde(default = "default_probe_slots")]
    pub probe_slots: usize,

    /// Brute-force probing stops after this many misses once a camera was found
    #[serde(default = "default_probe_max_misses")]
    pub probe_max_consecutive_failures: usize,

    /// Enumeration snapshots older than this are rebuilt on access
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,

    /// Open-and-read every descriptor while enumerating
    #[serde(default = "default_true")]
    pub probe_on_enumerate: bool,

    /// Resolution hint sent to the device; the device's answer always wins
    #[serde(default)]
    pub preferred_resolution: Option<(u32, u32)>,

    /// How long `stop()` waits for a wedged capture thread
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// MJPEG server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_stream_port")]
    pub port: u16,

    /// Frame rate served to each client
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Name announced to receivers
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Answer discovery broadcasts while streaming
    #[serde(default = "default_true")]
    pub announce: bool,
}

/// MJPEG client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard cap of the accumulation buffer in bytes
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// LAN discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Window for collecting replies
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,

    /// Addresses the request is sent to; empty means broadcast on `port`
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Virtual camera settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCameraConfig {
    #[serde(default = "default_virtual_fps")]
    pub fps: u32,

    /// Try the custom driver before the fallback
    #[serde(default = "default_true")]
    pub prefer_custom: bool,

    /// Use the custom driver even when its registration points elsewhere
    #[serde(default)]
    pub allow_custom_when_mismatch: bool,

    /// Explicit location of the custom driver module
    #[serde(default)]
    pub driver_path: Option<PathBuf>,
}

/// Receiver retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Reconnects attempted after the stream ends unexpectedly
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// First delay after a virtual camera failure
    #[serde(default = "default_sink_backoff_ms")]
    pub sink_backoff_ms: u64,

    #[serde(default = "default_sink_backoff_max_ms")]
    pub sink_backoff_max_ms: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

fn default_open_timeout_ms() -> u64 {
    3000
}

fn default_probe_read_attempts() -> u32 {
    3
}

fn default_probe_read_interval_ms() -> u64 {
    50
}

fn default_read_retry_ms() -> u64 {
    100
}

fn default_probe_slots() -> usize {
    10
}

fn default_probe_max_misses() -> usize {
    3
}

fn default_cache_max_age_secs() -> u64 {
    30
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_stream_port() -> u16 {
    DEFAULT_STREAM_PORT
}

fn default_target_fps() -> u32 {
    DEFAULT_TARGET_FPS
}

/// Host name from the environment, used as the announced display name
pub fn default_server_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "webcam-share".to_string())
}

fn default_buffer_cap() -> usize {
    MAX_CLIENT_BUFFER
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_discovery_timeout_ms() -> u64 {
    DEFAULT_DISCOVERY_TIMEOUT.as_millis() as u64
}

fn default_virtual_fps() -> u32 {
    DEFAULT_VIRTUAL_CAMERA_FPS
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_sink_backoff_ms() -> u64 {
    250
}

fn default_sink_backoff_max_ms() -> u64 {
    5000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            open_timeout_ms: default_open_timeout_ms(),
            probe_read_attempts: default_probe_read_attempts(),
            probe_read_interval_ms: default_probe_read_interval_ms(),
            read_retry_ms: default_read_retry_ms(),
            probe_slots: default_probe_slots(),
            probe_max_consecutive_failures: default_probe_max_misses(),
            cache_max_age_secs: default_cache_max_age_secs(),
            probe_on_enumerate: true,
            preferred_resolution: None,
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn probe_read_interval(&self) -> Duration {
        Duration::from_millis(self.probe_read_interval_ms)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_stream_port(),
            target_fps: default_target_fps(),
            name: default_server_name(),
            announce: true,
        }
    }
}

impl ServerConfig {
    /// Pacing interval between two parts sent to one client
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_cap: default_buffer_cap(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            timeout_ms: default_discovery_timeout_ms(),
            targets: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            fps: default_virtual_fps(),
            prefer_custom: true,
            allow_custom_when_mismatch: false,
            driver_path: None,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            sink_backoff_ms: default_sink_backoff_ms(),
            sink_backoff_max_ms: default_sink_backoff_max_ms(),
        }
    }
}

impl ReceiverConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }

    pub fn sink_backoff_max(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_max_ms)
    }
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "webcam-share")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults; an unreadable or invalid file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the config as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 9000

            [virtual_camera]
            allow_custom_when_mismatch = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.target_fps, DEFAULT_TARGET_FPS);
        assert!(config.virtual_camera.allow_custom_when_mismatch);
        assert!(config.virtual_camera.prefer_custom);
        assert_eq!(config.discovery.port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.client.buffer_cap, MAX_CLIENT_BUFFER);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let err = AppConfig::from_toml("[server]\nport = \"eighty\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("webcam-share-cfg-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.capture.jpeg_quality = 55;
        config.discovery.targets = vec!["127.0.0.1:8001".into()];
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.capture.jpeg_quality, 55);
        assert_eq!(loaded.discovery.targets, vec!["127.0.0.1:8001".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("webcam-share-does-not-exist.toml");
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, DEFAULT_STREAM_PORT);
    }

    #[test]
    fn test_frame_interval() {
        let server = ServerConfig {
            target_fps: 25,
            ..Default::default()
        };
        assert_eq!(server.frame_interval(), Duration::from_millis(40));
    }
}
