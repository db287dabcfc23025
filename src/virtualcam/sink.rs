//! Virtual camera sink with driver selection
//!
//! Every `start()` re-runs the driver diagnostic, so a custom driver that
//! was installed after the previous session is picked up on the next
//! reconfigure. A failing custom driver falls through to the fallback
//! within the same call.

use std::fmt;

use super::driver::{DriverStatus, DriverStatusCode};
use super::{DriverKind, SessionFormat, VirtualCameraBackend};
use crate::capture::Frame;
use crate::config::VirtualCameraConfig;
use crate::error::VirtualCameraError;

/// Diagnostic probe plus the backends it gates
pub struct DriverSet {
    pub diagnose: Box<dyn Fn() -> DriverStatus + Send>,
    pub custom: Option<Box<dyn VirtualCameraBackend>>,
    pub fallback: Option<Box<dyn VirtualCameraBackend>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCode {
    CustomStarted,
    FallbackStarted,
    AlreadyStarted,
}

impl StartCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StartCode::CustomStarted => "custom_started",
            StartCode::FallbackStarted => "fallback_started",
            StartCode::AlreadyStarted => "already_started",
        }
    }
}

impl fmt::Display for StartCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful `start()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub used_custom: bool,
    pub code: StartCode,
    pub message: String,
}

/// Snapshot of the running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub format: SessionFormat,
    pub kind: DriverKind,
    pub device: String,
    /// Increments on every successful start
    pub session_id: u64,
    pub frames_sent: u64,
}

pub struct VirtualCamera {
    format: SessionFormat,
    prefer_custom: bool,
    allow_custom_when_mismatch: bool,
    drivers: DriverSet,
    active: Option<SessionInfo>,
    scratch: Vec<u8>,
    sessions_started: u64,
}

impl VirtualCamera {
    pub fn new(config: &VirtualCameraConfig, width: u32, height: u32, drivers: DriverSet) -> Self {
        Self {
            format: SessionFormat {
                width,
                height,
                fps: config.fps,
            },
            prefer_custom: config.prefer_custom,
            allow_custom_when_mismatch: config.allow_custom_when_mismatch,
            drivers,
            active: None,
            scratch: Vec::new(),
            sessions_started: 0,
        }
    }

    /// Open a session, preferring the custom driver when it is healthy
    pub fn start(&mut self) -> Result<StartReport, VirtualCameraError> {
        if let Some(active) = &self.active {
            return Ok(StartReport {
                used_custom: active.kind == DriverKind::Custom,
                code: StartCode::AlreadyStarted,
                message: "Virtual camera is already running.".into(),
            });
        }
        if self.format.width == 0 || self.format.height == 0 {
            return Err(VirtualCameraError::InvalidSize {
                width: self.format.width,
                height: self.format.height,
            });
        }

        let custom_reason = if !self.prefer_custom {
            "Custom driver disabled by configuration.".to_string()
        } else {
            let status = (self.drivers.diagnose)();
            let usable = status.code == DriverStatusCode::Ok
                || (self.allow_custom_when_mismatch
                    && status.code == DriverStatusCode::PathMismatch);

            if !usable {
                tracing::debug!("Custom driver skipped: {} ({})", status.message, status.code);
                status.message
            } else {
                match self.drivers.custom.as_mut() {
                    Some(custom) => match custom.open(&self.format) {
                        Ok(device) => {
                            let message =
                                format!("Virtual camera started (custom driver: {})", device);
                            tracing::info!("{}", message);
                            self.activate(DriverKind::Custom, device);
                            return Ok(StartReport {
                                used_custom: true,
                                code: StartCode::CustomStarted,
                                message,
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Custom virtual camera failed: {}", e);
                            e.to_string()
                        }
                    },
                    None => "custom driver is not supported on this platform".into(),
                }
            }
        };

        let with_reason =
            |details: String| format!("{} (Custom unavailable: {})", details, custom_reason);

        let Some(fallback) = self.drivers.fallback.as_mut() else {
            return Err(VirtualCameraError::StartFailed(with_reason(
                "no fallback virtual camera on this platform".into(),
            )));
        };

        match fallback.open(&self.format) {
            Ok(device) => {
                let message = if self.prefer_custom {
                    format!("Virtual camera fallback started: {}", device)
                } else {
                    format!("Virtual camera started: {}", device)
                };
                tracing::info!("{}", message);
                self.activate(DriverKind::Fallback, device);
                Ok(StartReport {
                    used_custom: false,
                    code: StartCode::FallbackStarted,
                    message,
                })
            }
            Err(e) => Err(VirtualCameraError::StartFailed(with_reason(e.to_string()))),
        }
    }

    fn activate(&mut self, kind: DriverKind, device: String) {
        self.sessions_started += 1;
        self.active = Some(SessionInfo {
            format: self.format,
            kind,
            device,
            session_id: self.sessions_started,
            frames_sent: 0,
        });
    }

    /// Check that `frame` fits the running session
    pub fn check_frame(&self, frame: &Frame) -> Result<(), VirtualCameraError> {
        if self.active.is_none() {
            return Err(VirtualCameraError::NotStarted);
        }
        if frame.size() != (self.format.width, self.format.height) {
            return Err(VirtualCameraError::SizeMismatch {
                width: self.format.width,
                height: self.format.height,
                actual_width: frame.width,
                actual_height: frame.height,
            });
        }
        Ok(())
    }

    /// Deliver one frame. `false` means "not now": the sink is stopped, the
    /// size does not match, or the driver refused the frame.
    pub fn send_frame(&mut self, frame: &Frame) -> bool {
        if let Err(e) = self.check_frame(frame) {
            tracing::trace!("Frame not delivered: {}", e);
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let backend = match active.kind {
            DriverKind::Custom => self.drivers.custom.as_mut(),
            DriverKind::Fallback => self.drivers.fallback.as_mut(),
        };
        let Some(backend) = backend else {
            return false;
        };

        let pixels = backend.channel_order().arrange(frame, &mut self.scratch);
        match backend.send(pixels) {
            Ok(()) => {
                active.frames_sent += 1;
                true
            }
            Err(e) => {
                tracing::debug!("Virtual camera rejected frame: {}", e);
                false
            }
        }
    }

    /// Restart with a new size. Returns whether a restart happened.
    pub fn reconfigure(&mut self, width: u32, height: u32) -> Result<bool, VirtualCameraError> {
        if width == 0 || height == 0 {
            return Err(VirtualCameraError::InvalidSize { width, height });
        }
        if self.active.is_some() && (width, height) == (self.format.width, self.format.height) {
            return Ok(false);
        }

        tracing::info!(
            "Reconfiguring virtual camera {}x{} -> {}x{}",
            self.format.width,
            self.format.height,
            width,
            height
        );
        self.stop();
        self.format.width = width;
        self.format.height = height;
        self.start()?;
        Ok(true)
    }

    /// Close the session. Safe to call when stopped.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let backend = match active.kind {
            DriverKind::Custom => self.drivers.custom.as_mut(),
            DriverKind::Fallback => self.drivers.fallback.as_mut(),
        };
        if let Some(backend) = backend {
            backend.close();
        }
        tracing::info!(
            "Virtual camera {} stopped after {} frames",
            active.device,
            active.frames_sent
        );
    }

    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_custom(&self) -> bool {
        matches!(&self.active, Some(a) if a.kind == DriverKind::Custom)
    }

    pub fn format(&self) -> SessionFormat {
        self.format
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.active.clone()
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.stop();
    }
}
