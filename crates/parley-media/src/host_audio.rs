use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use parley_shared::TrackKind;
use tracing::{debug, info};

use crate::devices::{DeviceCapabilities, MediaConstraints, MediaDevices, MediaError};
use crate::track::{LocalStream, MediaTrack};

/// Microphone inventory from the host audio API. Reports no camera.
#[derive(Debug, Default)]
pub struct HostAudioDevices;

impl HostAudioDevices {
    pub fn new() -> Self {
        Self
    }
}

/// Check the default input device can be configured. Blocking.
fn check_default_input() -> Result<String, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(MediaError::NoDevice)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => MediaError::NoDevice,
        other => MediaError::Device(other.to_string()),
    })?;
    Ok(name)
}

async fn default_input() -> Result<String, MediaError> {
    tokio::task::spawn_blocking(check_default_input)
        .await
        .map_err(|e| MediaError::Device(e.to_string()))?
}

#[async_trait]
impl MediaDevices for HostAudioDevices {
    async fn probe(&self) -> Result<DeviceCapabilities, MediaError> {
        let has_microphone = match default_input().await {
            Ok(name) => {
                debug!(device = %name, "Input device found");
                true
            }
            Err(MediaError::NoDevice) => false,
            Err(e) => return Err(e),
        };
        Ok(DeviceCapabilities {
            has_camera: false,
            has_microphone,
        })
    }

    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if constraints.video {
            return Err(MediaError::NoDevice);
        }
        if !constraints.audio {
            return Ok(LocalStream::default());
        }

        let name = default_input().await?;
        info!(device = %name, "Using input device");
        Ok(LocalStream::new(vec![MediaTrack::new(TrackKind::Audio)]))
    }
}
