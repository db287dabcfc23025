//! Error types for the webcam sharing pipeline

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Virtual camera error: {0}")]
    VirtualCamera(#[from] VirtualCameraError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One failed open attempt, kept for the summarized [`CaptureError::Open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAttempt {
    pub backend: &'static str,
    pub index: usize,
    pub reason: String,
}

impl std::fmt::Display for OpenAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}: {}", self.backend, self.index, self.reason)
    }
}

fn join_attempts(attempts: &[OpenAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Capture subsystem errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Could not open camera {target} (tried {})", join_attempts(.attempts))]
    Open {
        target: String,
        attempts: Vec<OpenAttempt>,
    },

    #[error("Camera not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Timed out opening {backend}#{index}")]
    OpenTimeout { backend: &'static str, index: usize },

    #[error("Unsupported format: {0}")]
    FormatNotSupported(String),

    #[error("Frame read failed: {0}")]
    ReadFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    /// Classify an OS error raised while opening a device
    pub fn from_open_io(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CaptureError::PermissionDenied(format!("{}: {}", context, err))
            }
            std::io::ErrorKind::NotFound => {
                CaptureError::DeviceNotFound(format!("{}: {}", context, err))
            }
            _ if err.raw_os_error() == Some(16) => {
                // EBUSY
                CaptureError::Busy(format!("{}: {}", context, err))
            }
            _ => CaptureError::Backend(format!("{}: {}", context, err)),
        }
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame buffer: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Could not connect to {url}: HTTP {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Stream closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual camera errors
#[derive(Error, Debug)]
pub enum VirtualCameraError {
    #[error("Invalid virtual camera size: {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("Frame is {actual_width}x{actual_height} but session is {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Virtual camera is not started")]
    NotStarted,

    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Could not start virtual camera: {0}")]
    StartFailed(String),

    #[error("Frame delivery failed: {0}")]
    SendFailed(String),
}

/// Orchestration errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already running or starting")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Worker thread failed: {0}")]
    Worker(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
