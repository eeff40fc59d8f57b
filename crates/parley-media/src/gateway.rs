use std::sync::Arc;

use parley_shared::TrackKind;
use tracing::{debug, info, warn};

use crate::devices::{DeviceCapabilities, MediaConstraints, MediaDevices, MediaError};
use crate::track::LocalStream;

/// Constraint sets tried in order until one opens.
const FALLBACK_ORDER: [MediaConstraints; 3] = [
    MediaConstraints::CAMERA_AND_MIC,
    MediaConstraints::CAMERA_ONLY,
    MediaConstraints::MIC_ONLY,
];

/// Probes the device inventory and hands out local capture streams.
#[derive(Clone)]
pub struct MediaGateway {
    devices: Arc<dyn MediaDevices>,
}

impl MediaGateway {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Device inventory. A failing probe reports no devices.
    pub async fn probe(&self) -> DeviceCapabilities {
        match self.devices.probe().await {
            Ok(caps) => {
                debug!(camera = caps.has_camera, microphone = caps.has_microphone, "Devices probed");
                caps
            }
            Err(e) => {
                warn!("Device probe failed: {e}");
                DeviceCapabilities::none()
            }
        }
    }

    /// Acquire the best stream the inventory allows.
    ///
    /// Tries camera+mic, then camera only, then mic only, skipping any set
    /// that needs a device the inventory lacks. Fails with
    /// [`MediaError::NoDevice`] when nothing exists, otherwise with the last
    /// error seen.
    pub async fn acquire(&self, caps: DeviceCapabilities) -> Result<LocalStream, MediaError> {
        if caps.is_empty() {
            return Err(MediaError::NoDevice);
        }

        let mut last_err = MediaError::NoDevice;
        for constraints in FALLBACK_ORDER
            .iter()
            .filter(|c| (!c.video || caps.has_camera) && (!c.audio || caps.has_microphone))
        {
            match self.devices.open(*constraints).await {
                Ok(stream) => {
                    info!(
                        video = stream.has(TrackKind::Video),
                        audio = stream.has(TrackKind::Audio),
                        "Local media acquired"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(?constraints, "Media open failed: {e}");
                    last_err = e;
                }
            }
        }

        warn!("No usable local media: {last_err}");
        Err(last_err)
    }

    /// Flip every track of `kind`. `None` when the stream has none.
    pub fn toggle(&self, stream: &LocalStream, kind: TrackKind) -> Option<bool> {
        let enabled = stream.toggle(kind)?;
        debug!(kind = kind.as_str(), enabled, "Track toggled");
        Some(enabled)
    }

    pub fn release(&self, stream: &LocalStream) {
        if !stream.is_empty() {
            debug!(tracks = stream.tracks().len(), "Releasing local media");
        }
        stream.stop_all();
    }
}
