use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_shared::{CallError, TrackKind};
use thiserror::Error;
use tracing::debug;

use crate::track::{LocalStream, MediaTrack};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No camera or microphone available")]
    NoDevice,

    #[error("Permission to use the device was denied")]
    PermissionDenied,

    #[error("Device is in use by another application")]
    DeviceBusy,

    #[error("Device error: {0}")]
    Device(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NoDevice | MediaError::Device(_) => CallError::MediaUnavailable,
            MediaError::PermissionDenied => CallError::MediaPermissionDenied,
            MediaError::DeviceBusy => CallError::MediaDeviceBusy,
        }
    }
}

/// What the device inventory reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub has_camera: bool,
    pub has_microphone: bool,
}

impl DeviceCapabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_camera && !self.has_microphone
    }

    /// Capabilities actually present in an acquired stream.
    pub fn of_stream(stream: &LocalStream) -> Self {
        Self {
            has_camera: stream.has(TrackKind::Video),
            has_microphone: stream.has(TrackKind::Audio),
        }
    }
}

/// Which kinds of track to request from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const CAMERA_AND_MIC: Self = Self { audio: true, video: true };
    pub const CAMERA_ONLY: Self = Self { audio: false, video: true };
    pub const MIC_ONLY: Self = Self { audio: true, video: false };
}

/// Platform seam for device inventory and capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn probe(&self) -> Result<DeviceCapabilities, MediaError>;

    /// Open a stream honouring `constraints` exactly, or fail.
    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// In-process device backend with a fixed inventory and injectable failures.
///
/// Tracks it hands out carry no samples; the media engine's own capture
/// pipeline feeds real frames.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    capabilities: DeviceCapabilities,
    camera_failure: Mutex<Option<MediaError>>,
    microphone_failure: Mutex<Option<MediaError>>,
    opens: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            ..Default::default()
        }
    }

    pub fn with_camera_and_mic() -> Self {
        Self::new(DeviceCapabilities {
            has_camera: true,
            has_microphone: true,
        })
    }

    pub fn fail_camera(self, err: MediaError) -> Self {
        self.set_camera_failure(Some(err));
        self
    }

    pub fn fail_microphone(self, err: MediaError) -> Self {
        self.set_microphone_failure(Some(err));
        self
    }

    pub fn set_camera_failure(&self, err: Option<MediaError>) {
        if let Ok(mut slot) = self.camera_failure.lock() {
            *slot = err;
        }
    }

    pub fn set_microphone_failure(&self, err: Option<MediaError>) {
        if let Ok(mut slot) = self.microphone_failure.lock() {
            *slot = err;
        }
    }

    /// How many times `open` was called, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    fn failure(slot: &Mutex<Option<MediaError>>) -> Option<MediaError> {
        slot.lock().ok().and_then(|f| f.clone())
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn probe(&self) -> Result<DeviceCapabilities, MediaError> {
        Ok(self.capabilities)
    }

    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        self.opens.fetch_add(1, Ordering::Relaxed);

        let mut tracks = Vec::new();
        if constraints.video {
            if !self.capabilities.has_camera {
                return Err(MediaError::NoDevice);
            }
            if let Some(err) = Self::failure(&self.camera_failure) {
                return Err(err);
            }
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        if constraints.audio {
            if !self.capabilities.has_microphone {
                return Err(MediaError::NoDevice);
            }
            if let Some(err) = Self::failure(&self.microphone_failure) {
                return Err(err);
            }
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }

        debug!(?constraints, tracks = tracks.len(), "Synthetic stream opened");
        Ok(LocalStream::new(tracks))
    }
}
