//! Camera enumeration across competing backends
//!
//! Each backend reports `(name, index, stable id)` sightings independently.
//! The registry correlates them into one [`CameraDescriptor`] per physical
//! device, ranks the ways to open it, and checks empirically which devices
//! actually deliver frames.
//!
//! Correlation prefers a backend's stable identifier. Otherwise sightings
//! are matched on normalized name plus ordinal among equal names, which can
//! conflate two identical webcams when backends list them in different
//! orders.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::backend::{open_with_timeout, probe_read, BackendDevice, CaptureBackend};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, OpenAttempt};

/// Added to a backend's confidence when an earlier backend saw the same device
pub const CORROBORATION_BONUS: i32 = 5;

/// Result of trying to open and read a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvailabilityState {
    Unknown,
    Available,
    /// Opened but produced no frames, usually held by another process
    Busy,
    PermissionDenied,
    OpenFailed,
}

impl std::fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AvailabilityState::Unknown => "unknown",
            AvailabilityState::Available => "available",
            AvailabilityState::Busy => "busy",
            AvailabilityState::PermissionDenied => "permission_denied",
            AvailabilityState::OpenFailed => "open_failed",
        };
        f.write_str(text)
    }
}

/// One concrete way to open a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCandidate {
    pub backend: &'static str,
    pub index: usize,
    /// Higher is tried first
    pub confidence: i32,
}

/// Logical identity of one camera
#[derive(Debug, Clone)]
pub struct CameraDescriptor {
    /// Unique within one snapshot
    pub key: String,
    pub name: String,
    /// Backend-agnostic identifier used for de-duplication
    pub moniker_id: String,
    pub stable_id: Option<String>,
    /// Backends that reported this device
    pub sources: BTreeSet<&'static str>,
    /// Sorted by confidence, then backend priority, then index
    pub candidates: Vec<OpenCandidate>,
    pub availability: AvailabilityState,
    pub last_error: Option<String>,
    /// Backend that last opened and read successfully
    pub preferred_backend: Option<&'static str>,
}

impl CameraDescriptor {
    /// Candidates in the order they should be tried, preferred backend first
    pub fn ordered_candidates(&self) -> Vec<OpenCandidate> {
        let mut ordered = self.candidates.clone();
        if let Some(preferred) = self.preferred_backend {
            // stable sort keeps the rest in rank order
            ordered.sort_by_key(|c| c.backend != preferred);
        }
        ordered
    }

    /// Label for listings
    pub fn display_label(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().copied().collect();
        format!("{} [{}] ({})", self.name, self.key, sources.join("+"))
    }
}

/// Outcome of an availability probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub state: AvailabilityState,
    pub backend: Option<&'static str>,
    pub error: Option<String>,
}

/// One enumeration pass
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub generation: u64,
    /// Selectable cameras
    pub cameras: Vec<CameraDescriptor>,
    /// Devices that were seen but could not be opened and read
    pub diagnostics: Vec<CameraDescriptor>,
    pub taken_at: Instant,
}

impl DeviceSnapshot {
    pub fn get(&self, key: &str) -> Option<&CameraDescriptor> {
        self.cameras.iter().find(|d| d.key == key)
    }
}

/// Process-wide camera registry with a cached snapshot
pub struct DeviceRegistry {
    /// Highest priority first
    backends: Vec<Arc<dyn CaptureBackend>>,
    config: CaptureConfig,
    cache: RwLock<Option<Arc<DeviceSnapshot>>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(backends: Vec<Arc<dyn CaptureBackend>>, config: CaptureConfig) -> Self {
        Self {
            backends,
            config,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Registry over the platform's hardware backends
    pub fn system(config: CaptureConfig) -> Self {
        Self::new(super::platform_backends(&config), config)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Backend by id
    pub fn backend(&self, id: &str) -> Option<Arc<dyn CaptureBackend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    /// Highest priority backend, used for legacy index selection
    pub fn primary_backend(&self) -> Option<Arc<dyn CaptureBackend>> {
        self.backends.first().cloned()
    }

    /// Cached snapshot, rebuilt when missing or older than the configured age.
    ///
    /// Callers arriving while a rebuild is running wait for it and share its
    /// result.
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        if let Some(snapshot) = self.fresh_cached() {
            return snapshot;
        }

        let _guard = self.refresh_lock.lock();
        if let Some(snapshot) = self.fresh_cached() {
            return snapshot;
        }
        self.rebuild()
    }

    /// Recompute from scratch and replace the cache.
    ///
    /// A caller that had to wait for a concurrent refresh reuses its result.
    pub fn refresh(&self) -> Arc<DeviceSnapshot> {
        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock();

        if self.generation.load(Ordering::SeqCst) != seen {
            if let Some(snapshot) = self.cache.read().clone() {
                return snapshot;
            }
        }
        self.rebuild()
    }

    /// Selectable cameras from the current snapshot
    pub fn enumerate(&self) -> Vec<CameraDescriptor> {
        self.snapshot().cameras.clone()
    }

    /// Look a camera up by key. Misses when the device is gone from the
    /// latest snapshot.
    pub fn lookup(&self, key: &str) -> Option<CameraDescriptor> {
        self.snapshot().get(key).cloned()
    }

    /// Open each candidate in priority order and read a few frames
    pub fn probe_availability(&self, descriptor: &CameraDescriptor) -> ProbeOutcome {
        let mut attempts = Vec::new();
        let mut saw_denied = false;
        let mut saw_busy = false;

        for candidate in descriptor.ordered_candidates() {
            let Some(backend) = self.backend(candidate.backend) else {
                continue;
            };

            let result = open_with_timeout(backend, candidate.index, self.config.open_timeout())
                .and_then(|mut device| {
                    probe_read(
                        device.as_mut(),
                        self.config.probe_read_attempts,
                        self.config.probe_read_interval(),
                    )
                });

            match result {
                Ok(_) => {
                    return ProbeOutcome {
                        state: AvailabilityState::Available,
                        backend: Some(candidate.backend),
                        error: None,
                    }
                }
                Err(e) => {
                    match e {
                        CaptureError::PermissionDenied(_) => saw_denied = true,
                        CaptureError::Busy(_) => saw_busy = true,
                        _ => {}
                    }
                    tracing::debug!("Probe {}#{} failed: {}", candidate.backend, candidate.index, e);
                    attempts.push(OpenAttempt {
                        backend: candidate.backend,
                        index: candidate.index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let state = if saw_denied {
            AvailabilityState::PermissionDenied
        } else if saw_busy {
            AvailabilityState::Busy
        } else {
            AvailabilityState::OpenFailed
        };

        ProbeOutcome {
            state,
            backend: None,
            error: Some(
                attempts
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }

    fn fresh_cached(&self) -> Option<Arc<DeviceSnapshot>> {
        self.cache
            .read()
            .as_ref()
            .filter(|s| s.taken_at.elapsed() <= self.config.cache_max_age())
            .cloned()
    }

    /// Must be called with `refresh_lock` held
    fn rebuild(&self) -> Arc<DeviceSnapshot> {
        let started = Instant::now();
        let mut listings = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            match backend.enumerate() {
                Ok(devices) => {
                    tracing::debug!("{} reported {} device(s)", backend.id(), devices.len());
                    listings.push(BackendListing {
                        backend: backend.id(),
                        base_confidence: backend.base_confidence(),
                        devices,
                    });
                }
                Err(e) => tracing::warn!("Enumeration via {} failed: {}", backend.id(), e),
            }
        }

        let mut descriptors = merge_sightings(&listings);
        let probed_by_slot = descriptors.is_empty();
        if probed_by_slot {
            descriptors = self.brute_force_probe();
        }

        let mut cameras = Vec::new();
        let mut diagnostics = Vec::new();
        for mut descriptor in descriptors {
            if self.config.probe_on_enumerate && !probed_by_slot {
                let outcome = self.probe_availability(&descriptor);
                descriptor.availability = outcome.state;
                descriptor.last_error = outcome.error;
                if outcome.backend.is_some() {
                    descriptor.preferred_backend = outcome.backend;
                }
            }

            let state = descriptor.availability;
            match state {
                AvailabilityState::Available | AvailabilityState::Unknown => {
                    cameras.push(descriptor)
                }
                _ => diagnostics.push(descriptor),
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(DeviceSnapshot {
            generation,
            cameras,
            diagnostics,
            taken_at: Instant::now(),
        });

        tracing::info!(
            "Camera enumeration #{}: {} selectable, {} diagnostics-only ({:?})",
            generation,
            snapshot.cameras.len(),
            snapshot.diagnostics.len(),
            started.elapsed()
        );

        *self.cache.write() = Some(snapshot.clone());
        snapshot
    }

    /// Try low-index slots on the primary backend when nothing was listed
    fn brute_force_probe(&self) -> Vec<CameraDescriptor> {
        let Some(backend) = self.primary_backend() else {
            return Vec::new();
        };
        tracing::info!(
            "No cameras listed, probing {} slot(s) via {}",
            self.config.probe_slots,
            backend.id()
        );

        let mut found = Vec::new();
        let mut keys = HashSet::new();
        let mut misses = 0;

        for index in 0..self.config.probe_slots {
            let result = open_with_timeout(backend.clone(), index, self.config.open_timeout())
                .and_then(|mut device| {
                    probe_read(
                        device.as_mut(),
                        self.config.probe_read_attempts,
                        self.config.probe_read_interval(),
                    )
                    .map(|_| device.describe())
                });

            match result {
                Ok(description) => {
                    misses = 0;
                    let moniker_id = format!("{}-probe:{}", backend.id(), index);
                    let key = unique_key(&moniker_id, &mut keys);
                    found.push(CameraDescriptor {
                        key,
                        name: description,
                        moniker_id,
                        stable_id: None,
                        sources: BTreeSet::from([backend.id()]),
                        candidates: vec![OpenCandidate {
                            backend: backend.id(),
                            index,
                            confidence: backend.base_confidence(),
                        }],
                        availability: AvailabilityState::Available,
                        last_error: None,
                        preferred_backend: Some(backend.id()),
                    });
                }
                Err(e) => {
                    tracing::debug!("Slot {} unusable: {}", index, e);
                    misses += 1;
                    if !found.is_empty() && misses >= self.config.probe_max_consecutive_failures {
                        break;
                    }
                }
            }
        }

        found
    }
}

/// Devices reported by one backend
#[derive(Debug, Clone)]
pub struct BackendListing {
    pub backend: &'static str,
    pub base_confidence: i32,
    pub devices: Vec<BackendDevice>,
}

/// Correlate per-backend listings into descriptors.
///
/// `listings` must be in backend priority order; a sighting is corroborated
/// when an earlier listing already produced its descriptor.
pub fn merge_sightings(listings: &[BackendListing]) -> Vec<CameraDescriptor> {
    let mut descriptors: Vec<CameraDescriptor> = Vec::new();
    let mut keys = HashSet::new();
    let mut by_name_ordinal: HashMap<(String, usize), usize> = HashMap::new();
    let mut by_stable_id: HashMap<String, usize> = HashMap::new();

    for listing in listings {
        let mut name_counts: HashMap<String, usize> = HashMap::new();

        for device in &listing.devices {
            let normalized = normalize_name(&device.name);
            let ordinal = {
                let count = name_counts.entry(normalized.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let stable = device.stable_id.as_ref().map(|s| s.to_lowercase());

            let already_from_backend =
                |slot: usize| descriptors[slot].sources.contains(listing.backend);
            let existing = stable
                .as_ref()
                .and_then(|id| by_stable_id.get(id))
                .filter(|slot| !already_from_backend(**slot))
                .or_else(|| {
                    by_name_ordinal
                        .get(&(normalized.clone(), ordinal))
                        .filter(|slot| !already_from_backend(**slot))
                })
                .copied();

            let slot = match existing {
                Some(slot) => slot,
                None => {
                    let moniker_id = match &stable {
                        Some(id) => format!("{}-link:{}", listing.backend, id),
                        None => format!("{}-name:{}:{}", listing.backend, normalized, ordinal),
                    };
                    let key = unique_key(&moniker_id, &mut keys);
                    descriptors.push(CameraDescriptor {
                        key,
                        name: device.name.clone(),
                        moniker_id,
                        stable_id: stable.clone(),
                        sources: BTreeSet::new(),
                        candidates: Vec::new(),
                        availability: AvailabilityState::Unknown,
                        last_error: None,
                        preferred_backend: None,
                    });
                    descriptors.len() - 1
                }
            };

            by_name_ordinal
                .entry((normalized, ordinal))
                .or_insert(slot);
            if let Some(id) = stable {
                by_stable_id.entry(id.clone()).or_insert(slot);
                if descriptors[slot].stable_id.is_none() {
                    descriptors[slot].stable_id = Some(id);
                }
            }

            let descriptor = &mut descriptors[slot];
            let corroborated = !descriptor.sources.is_empty();
            descriptor.sources.insert(listing.backend);
            descriptor.candidates.push(OpenCandidate {
                backend: listing.backend,
                index: device.index,
                confidence: listing.base_confidence
                    + if corroborated { CORROBORATION_BONUS } else { 0 },
            });
        }
    }

    let rank: HashMap<&str, usize> = listings
        .iter()
        .enumerate()
        .map(|(rank, l)| (l.backend, rank))
        .collect();
    for descriptor in &mut descriptors {
        descriptor.candidates.sort_by_key(|c| {
            (
                -c.confidence,
                rank.get(c.backend).copied().unwrap_or(usize::MAX),
                c.index,
            )
        });
        descriptor.preferred_backend = descriptor.candidates.first().map(|c| c.backend);
    }

    descriptors
}

/// Strip all whitespace and fold case
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<String>()
        .to_lowercase()
}

/// Reduce to `[a-z0-9_-]`, collapsing runs of dashes
fn tokenize(value: &str) -> String {
    let mut token = String::with_capacity(value.len());
    for c in value.to_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && token.ends_with('-') {
            continue;
        }
        token.push(c);
    }
    let token = token.trim_matches('-');
    if token.is_empty() {
        "camera".to_string()
    } else {
        token.to_string()
    }
}

fn unique_key(base: &str, existing: &mut HashSet<String>) -> String {
    let key = tokenize(base);
    let mut candidate = key.clone();
    let mut suffix = 2;
    while existing.contains(&candidate) {
        candidate = format!("{}-{}", key, suffix);
        suffix += 1;
    }
    existing.insert(candidate.clone());
    candidate
}
