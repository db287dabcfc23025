//! Custom softcam driver (Windows)
//!
//! `webcamshare_camera.dll` is loaded at runtime and driven through three
//! exports: `scCreateCamera`, `scSendFrame` and `scDeleteCamera`. The
//! driver paces frame delivery itself.

use std::ffi::c_void;
use windows::core::{s, HSTRING};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use super::driver::DriverLocator;
use super::{ChannelOrder, DriverKind, SessionFormat, VirtualCameraBackend};
use crate::error::VirtualCameraError;

type CreateCamera = unsafe extern "C" fn(i32, i32, f32) -> *mut c_void;
type DeleteCamera = unsafe extern "C" fn(*mut c_void);
type SendFrame = unsafe extern "C" fn(*mut c_void, *const c_void);

struct Exports {
    module: HMODULE,
    create: CreateCamera,
    delete: DeleteCamera,
    send: SendFrame,
}

impl Exports {
    fn load(locator: &DriverLocator) -> Result<Self, VirtualCameraError> {
        let path = locator.find().ok_or_else(|| {
            VirtualCameraError::DriverUnavailable(format!(
                "{} was not found.",
                super::driver::DRIVER_FILE_NAME
            ))
        })?;

        let module = unsafe { LoadLibraryW(&HSTRING::from(path.as_os_str())) }.map_err(|e| {
            VirtualCameraError::DriverUnavailable(format!(
                "Found {} but could not load it: {}",
                path.display(),
                e
            ))
        })?;

        // Signatures match softcam.h
        let exports = unsafe {
            let create = GetProcAddress(module, s!("scCreateCamera"));
            let delete = GetProcAddress(module, s!("scDeleteCamera"));
            let send = GetProcAddress(module, s!("scSendFrame"));
            match (create, delete, send) {
                (Some(create), Some(delete), Some(send)) => Some(Self {
                    module,
                    create: std::mem::transmute::<_, CreateCamera>(create),
                    delete: std::mem::transmute::<_, DeleteCamera>(delete),
                    send: std::mem::transmute::<_, SendFrame>(send),
                }),
                _ => None,
            }
        };

        exports.ok_or_else(|| {
            unsafe {
                let _ = FreeLibrary(module);
            }
            VirtualCameraError::DriverUnavailable(format!(
                "{} is missing softcam exports",
                path.display()
            ))
        })
    }
}

impl Drop for Exports {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeLibrary(self.module);
        }
    }
}

pub struct SoftcamBackend {
    locator: DriverLocator,
    exports: Option<Exports>,
    camera: *mut c_void,
    frame_len: usize,
}

// The camera handle is only touched by the owning thread.
unsafe impl Send for SoftcamBackend {}

impl SoftcamBackend {
    pub fn new(locator: DriverLocator) -> Self {
        Self {
            locator,
            exports: None,
            camera: std::ptr::null_mut(),
            frame_len: 0,
        }
    }
}

impl VirtualCameraBackend for SoftcamBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Custom
    }

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Bgr
    }

    fn open(&mut self, format: &SessionFormat) -> Result<String, VirtualCameraError> {
        self.close();
        if self.exports.is_none() {
            self.exports = Some(Exports::load(&self.locator)?);
        }
        let Some(exports) = self.exports.as_ref() else {
            return Err(VirtualCameraError::NotStarted);
        };

        let camera = unsafe {
            (exports.create)(format.width as i32, format.height as i32, format.fps as f32)
        };
        if camera.is_null() {
            return Err(VirtualCameraError::StartFailed(
                "Custom camera creation returned a null handle".into(),
            ));
        }

        self.camera = camera;
        self.frame_len = format.frame_len();
        Ok("WebCamShare Camera".into())
    }

    fn send(&mut self, pixels: &[u8]) -> Result<(), VirtualCameraError> {
        let Some(exports) = self.exports.as_ref() else {
            return Err(VirtualCameraError::NotStarted);
        };
        if self.camera.is_null() {
            return Err(VirtualCameraError::NotStarted);
        }
        // the driver reads exactly one frame from the pointer
        if pixels.len() != self.frame_len {
            return Err(VirtualCameraError::SendFailed(format!(
                "expected {} bytes, got {}",
                self.frame_len,
                pixels.len()
            )));
        }
        unsafe { (exports.send)(self.camera, pixels.as_ptr().cast()) };
        Ok(())
    }

    fn close(&mut self) {
        if self.camera.is_null() {
            return;
        }
        if let Some(exports) = self.exports.as_ref() {
            unsafe { (exports.delete)(self.camera) };
        }
        self.camera = std::ptr::null_mut();
    }
}

impl Drop for SoftcamBackend {
    fn drop(&mut self) {
        self.close();
    }
}
