//! Custom driver diagnostics and registration
//!
//! The custom camera is an in-process COM server. It is usable only when the
//! module file exists and the registry's `InprocServer32` entry points at
//! that same file. [`diagnose`] is read-only and cheap enough to call before
//! every session start.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::VirtualCameraConfig;

/// COM class id the custom camera registers under
pub const CUSTOM_CAMERA_CLSID: &str = "{AEF3B972-5FA5-4647-9571-358EB472BC9E}";

/// File name of the custom driver module
pub const DRIVER_FILE_NAME: &str = "webcamshare_camera.dll";

/// Outcome of a diagnostic pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatusCode {
    Ok,
    DllNotFound,
    NotRegistered,
    PathMismatch,
    RegistryError,
}

impl DriverStatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverStatusCode::Ok => "ok",
            DriverStatusCode::DllNotFound => "dll_not_found",
            DriverStatusCode::NotRegistered => "not_registered",
            DriverStatusCode::PathMismatch => "path_mismatch",
            DriverStatusCode::RegistryError => "registry_error",
        }
    }
}

impl fmt::Display for DriverStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub code: DriverStatusCode,
    pub dll_path: Option<PathBuf>,
    pub registered_path: Option<String>,
    pub message: String,
}

impl DriverStatus {
    pub fn dll_found(&self) -> bool {
        self.dll_path.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.registered_path.is_some()
    }

    pub fn path_matches(&self) -> bool {
        self.code == DriverStatusCode::Ok
    }

    fn new(
        code: DriverStatusCode,
        dll_path: Option<PathBuf>,
        registered_path: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            dll_path,
            registered_path,
            message: message.into(),
        }
    }
}

/// Finds the driver module on disk
#[derive(Debug, Clone, Default)]
pub struct DriverLocator {
    explicit: Option<PathBuf>,
}

impl DriverLocator {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }

    pub fn from_config(config: &VirtualCameraConfig) -> Self {
        Self::new(config.driver_path.clone())
    }

    /// Search order: configured path, next to the executable, working directory
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.explicit {
            candidates.push(path.clone());
        }
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            candidates.push(dir.join(DRIVER_FILE_NAME));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(DRIVER_FILE_NAME));
        }
        candidates
    }

    pub fn find(&self) -> Option<PathBuf> {
        self.candidates()
            .into_iter()
            .find(|p| p.is_file())
            .map(|p| p.canonicalize().unwrap_or(p))
    }
}

/// Read access to the COM registration
pub trait RegistrationStore {
    /// `Ok(None)` when the class is not registered
    fn registered_path(&self, clsid: &str) -> Result<Option<String>, String>;
}

/// The host registry
pub struct SystemRegistry;

impl RegistrationStore for SystemRegistry {
    #[cfg(windows)]
    fn registered_path(&self, clsid: &str) -> Result<Option<String>, String> {
        use windows::Win32::System::Registry::{HKEY_CLASSES_ROOT, HKEY_LOCAL_MACHINE};

        let suffix = format!("CLSID\\{}\\InprocServer32", clsid);
        let keys = [
            (HKEY_CLASSES_ROOT, suffix.clone()),
            (HKEY_LOCAL_MACHINE, format!("SOFTWARE\\Classes\\{}", suffix)),
        ];

        for (root, subkey) in keys {
            if let Some(path) = registry::default_value(root, &subkey)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    #[cfg(not(windows))]
    fn registered_path(&self, _clsid: &str) -> Result<Option<String>, String> {
        Err("Driver registry diagnostics are available on Windows only.".into())
    }
}

#[cfg(windows)]
mod registry {
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{RegGetValueW, HKEY, RRF_RT_REG_SZ};

    /// Default value of `root\subkey`, `Ok(None)` when the key is absent.
    ///
    /// `REG_EXPAND_SZ` values come back expanded.
    pub(super) fn default_value(root: HKEY, subkey: &str) -> Result<Option<String>, String> {
        let subkey = HSTRING::from(subkey);
        let mut size = 0u32;

        let status = unsafe {
            RegGetValueW(
                root,
                &subkey,
                PCWSTR::null(),
                RRF_RT_REG_SZ,
                None,
                None,
                Some(&mut size),
            )
        };
        if status == ERROR_FILE_NOT_FOUND || status == ERROR_PATH_NOT_FOUND {
            return Ok(None);
        }
        if status != ERROR_SUCCESS {
            return Err(format!(
                "Could not read driver registry {} (error {})",
                subkey, status.0
            ));
        }

        let mut buffer = vec![0u16; (size as usize + 1) / 2];
        let status = unsafe {
            RegGetValueW(
                root,
                &subkey,
                PCWSTR::null(),
                RRF_RT_REG_SZ,
                None,
                Some(buffer.as_mut_ptr().cast()),
                Some(&mut size),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(format!(
                "Could not read driver registry {} (error {})",
                subkey, status.0
            ));
        }

        buffer.truncate(size as usize / 2);
        Ok(super::decode_reg_sz(&buffer))
    }
}

/// Text of a `REG_SZ` payload, `None` when blank
pub fn decode_reg_sz(data: &[u16]) -> Option<String> {
    let end = data.iter().position(|&c| c == 0).unwrap_or(data.len());
    let value = String::from_utf16_lossy(&data[..end]);
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Comparable form of a module path: unquoted, absolute, lexically
/// normalized and case-folded on Windows
pub fn normalize_path(path: &str) -> String {
    let mut text = path.trim();
    if text.len() >= 2 {
        let bytes = text.as_bytes();
        if bytes[0] == bytes[text.len() - 1] && (bytes[0] == b'"' || bytes[0] == b'\'') {
            text = text[1..text.len() - 1].trim();
        }
    }
    if text.is_empty() {
        return String::new();
    }

    let raw = PathBuf::from(text);
    let resolved = raw.canonicalize().unwrap_or_else(|_| {
        if raw.is_absolute() {
            raw.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&raw))
                .unwrap_or_else(|_| raw.clone())
        }
    });

    let mut normalized = PathBuf::new();
    for component in resolved.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    let text = normalized.to_string_lossy().into_owned();
    let text = text.strip_prefix(r"\\?\").map(str::to_string).unwrap_or(text);
    if cfg!(windows) {
        text.to_lowercase()
    } else {
        text
    }
}

/// Diagnose against the host registry
pub fn diagnose(locator: &DriverLocator) -> DriverStatus {
    diagnose_with(locator.find(), &SystemRegistry)
}

/// Diagnose a located module (or its absence) against `store`
pub fn diagnose_with(dll_path: Option<PathBuf>, store: &dyn RegistrationStore) -> DriverStatus {
    let Some(dll_path) = dll_path else {
        return DriverStatus::new(
            DriverStatusCode::DllNotFound,
            None,
            None,
            format!("{} was not found.", DRIVER_FILE_NAME),
        );
    };

    let registered = match store.registered_path(CUSTOM_CAMERA_CLSID) {
        Ok(registered) => registered,
        Err(message) => {
            return DriverStatus::new(DriverStatusCode::RegistryError, Some(dll_path), None, message)
        }
    };

    let Some(registered) = registered else {
        return DriverStatus::new(
            DriverStatusCode::NotRegistered,
            Some(dll_path),
            None,
            "Driver is not registered. Run `receiver driver install`.",
        );
    };

    if normalize_path(&dll_path.to_string_lossy()) != normalize_path(&registered) {
        return DriverStatus::new(
            DriverStatusCode::PathMismatch,
            Some(dll_path),
            Some(registered),
            "Registered driver path differs from this installation. Reinstall to repair.",
        );
    }

    DriverStatus::new(
        DriverStatusCode::Ok,
        Some(dll_path),
        Some(registered),
        "Custom driver is ready.",
    )
}

/// Outcome of an install or uninstall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverActionCode {
    Success,
    /// The user dismissed the elevation prompt
    ElevationDeclined,
    /// The privileged step ran and failed, or could not be launched
    OperationFailed,
    DriverNotFound,
}

impl DriverActionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverActionCode::Success => "success",
            DriverActionCode::ElevationDeclined => "elevation_declined",
            DriverActionCode::OperationFailed => "operation_failed",
            DriverActionCode::DriverNotFound => "driver_not_found",
        }
    }
}

impl fmt::Display for DriverActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverActionResult {
    pub ok: bool,
    pub code: DriverActionCode,
    pub message: String,
}

impl DriverActionResult {
    fn new(code: DriverActionCode, message: impl Into<String>) -> Self {
        Self {
            ok: code == DriverActionCode::Success,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Install,
    Uninstall,
}

impl Action {
    fn noun(self) -> &'static str {
        match self {
            Action::Install => "installation",
            Action::Uninstall => "uninstallation",
        }
    }

    fn regsvr32_args(self, dll: &Path) -> String {
        match self {
            Action::Install => format!("/s \"{}\"", dll.display()),
            Action::Uninstall => format!("/u /s \"{}\"", dll.display()),
        }
    }
}

/// Register the driver module. Prompts for elevation.
pub fn install(locator: &DriverLocator) -> DriverActionResult {
    run_action(locator, Action::Install)
}

/// Unregister the driver module. Prompts for elevation.
pub fn uninstall(locator: &DriverLocator) -> DriverActionResult {
    run_action(locator, Action::Uninstall)
}

fn run_action(locator: &DriverLocator, action: Action) -> DriverActionResult {
    let Some(dll) = locator.find() else {
        return DriverActionResult::new(
            DriverActionCode::DriverNotFound,
            format!("{} was not found.", DRIVER_FILE_NAME),
        );
    };

    tracing::info!("Starting driver {} for {}", action.noun(), dll.display());
    let result = run_elevated_regsvr32(&dll, action);
    match result.code {
        DriverActionCode::Success => tracing::info!("{}", result.message),
        _ => tracing::warn!("{}", result.message),
    }
    result
}

#[cfg(windows)]
fn run_elevated_regsvr32(dll: &Path, action: Action) -> DriverActionResult {
    // Start-Process -Verb RunAs raises the consent prompt and -Wait lets us
    // forward regsvr32's exit code.
    let args = action.regsvr32_args(dll).replace('\'', "''");
    let script = format!(
        "$p = Start-Process -FilePath 'regsvr32.exe' -ArgumentList '{}' -Verb RunAs -Wait -PassThru -WindowStyle Hidden -ErrorAction Stop; exit $p.ExitCode",
        args
    );

    match std::process::Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .output()
    {
        Ok(output) => classify_elevated_exit(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
            action,
        ),
        Err(e) => DriverActionResult::new(
            DriverActionCode::OperationFailed,
            format!("Failed to launch elevation helper: {}", e),
        ),
    }
}

#[cfg(not(windows))]
fn run_elevated_regsvr32(_dll: &Path, action: Action) -> DriverActionResult {
    DriverActionResult::new(
        DriverActionCode::OperationFailed,
        format!("Driver {} is only supported on Windows.", action.noun()),
    )
}

/// Map the helper's exit status and error text onto an action code
fn classify_elevated_exit(code: Option<i32>, stderr: &str, action: Action) -> DriverActionResult {
    let stderr = stderr.to_lowercase();
    if stderr.contains("canceled by the user") || stderr.contains("cancelled by the user") {
        return DriverActionResult::new(
            DriverActionCode::ElevationDeclined,
            "User cancelled the elevation prompt.",
        );
    }

    match code {
        Some(0) => DriverActionResult::new(
            DriverActionCode::Success,
            format!("Driver {} completed successfully.", action.noun()),
        ),
        Some(code) => DriverActionResult::new(
            DriverActionCode::OperationFailed,
            format!("Driver {} failed (regsvr32 exit code: {}).", action.noun(), code),
        ),
        None => DriverActionResult::new(
            DriverActionCode::OperationFailed,
            format!("Driver {} was interrupted.", action.noun()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStore(Result<Option<String>, String>);

    impl RegistrationStore for FixedStore {
        fn registered_path(&self, _clsid: &str) -> Result<Option<String>, String> {
            self.0.clone()
        }
    }

    fn temp_driver() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("webcam-share-driver-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DRIVER_FILE_NAME);
        std::fs::write(&path, b"MZ").unwrap();
        path
    }

    #[test]
    fn test_missing_module() {
        let status = diagnose_with(None, &FixedStore(Ok(None)));
        assert_eq!(status.code, DriverStatusCode::DllNotFound);
        assert!(!status.dll_found());
    }

    #[test]
    fn test_status_codes() {
        let dll = temp_driver();

        let status = diagnose_with(Some(dll.clone()), &FixedStore(Ok(None)));
        assert_eq!(status.code, DriverStatusCode::NotRegistered);

        let status = diagnose_with(
            Some(dll.clone()),
            &FixedStore(Err("access denied".into())),
        );
        assert_eq!(status.code, DriverStatusCode::RegistryError);
        assert_eq!(status.message, "access denied");

        let status = diagnose_with(
            Some(dll.clone()),
            &FixedStore(Ok(Some("/somewhere/else/webcamshare_camera.dll".into()))),
        );
        assert_eq!(status.code, DriverStatusCode::PathMismatch);
        assert!(status.is_registered());

        let quoted = format!("\"{}\"", dll.display());
        let status = diagnose_with(Some(dll), &FixedStore(Ok(Some(quoted))));
        assert_eq!(status.code, DriverStatusCode::Ok);
        assert!(status.path_matches());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("  "), "");
        assert_eq!(normalize_path("'/opt/x/../y/a.dll'"), normalize_path("/opt/y/a.dll"));
        assert_eq!(normalize_path("/opt/./y/a.dll"), normalize_path("/opt/y/a.dll"));
    }

    fn wide(text: &str) -> Vec<u16> {
        text.encode_utf16().collect()
    }

    #[test]
    fn test_decode_reg_sz() {
        let mut data = wide("C:\\Apps\\webcamshare_camera.dll");
        data.push(0);
        assert_eq!(
            decode_reg_sz(&data).as_deref(),
            Some("C:\\Apps\\webcamshare_camera.dll")
        );

        // stops at the first terminator even when the buffer is oversized
        let mut padded = wide("C:\\a.dll");
        padded.extend_from_slice(&[0, 0, 0x41]);
        assert_eq!(decode_reg_sz(&padded).as_deref(), Some("C:\\a.dll"));

        assert_eq!(decode_reg_sz(&wide("   ")), None);
        assert_eq!(decode_reg_sz(&[]), None);
    }

    #[test]
    fn test_system_registry_reports_unavailable_off_windows() {
        if cfg!(windows) {
            return;
        }
        let dll = temp_driver();
        let status = diagnose_with(Some(dll), &SystemRegistry);
        assert_eq!(status.code, DriverStatusCode::RegistryError);
    }

    #[test]
    fn test_elevation_declined_is_distinct() {
        let declined = classify_elevated_exit(
            Some(1),
            "Start-Process : This command cannot be run due to the error: The operation was canceled by the user.",
            Action::Install,
        );
        assert_eq!(declined.code, DriverActionCode::ElevationDeclined);
        assert!(!declined.ok);

        let failed = classify_elevated_exit(Some(5), "", Action::Uninstall);
        assert_eq!(failed.code, DriverActionCode::OperationFailed);
        assert!(failed.message.contains("exit code: 5"));

        let ok = classify_elevated_exit(Some(0), "", Action::Install);
        assert!(ok.ok);
    }

    #[test]
    fn test_regsvr32_arguments() {
        let dll = Path::new("/x/webcamshare_camera.dll");
        assert_eq!(
            Action::Install.regsvr32_args(dll),
            "/s \"/x/webcamshare_camera.dll\""
        );
        assert!(Action::Uninstall.regsvr32_args(dll).starts_with("/u /s "));
    }

    #[test]
    fn test_install_without_module() {
        let locator = DriverLocator::new(Some(PathBuf::from("/nonexistent/webcamshare_camera.dll")));
        // only meaningful when no stray module sits next to the test binary
        if locator.find().is_none() {
            assert_eq!(install(&locator).code, DriverActionCode::DriverNotFound);
        }
    }
}
