use thiserror::Error;

/// Failures of one call attempt, as surfaced to the UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("No camera or microphone found on this device")]
    MediaUnavailable,

    #[error("Permission blocked. Allow camera/microphone access")]
    MediaPermissionDenied,

    #[error("Camera or microphone is in use by another app")]
    MediaDeviceBusy,

    #[error("Signaling write failed: {0}")]
    SignalingWriteFailure(String),

    #[error("Signaling read failed: {0}")]
    SignalingReadFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown value: {0}")]
pub struct ParseStatusError(pub String);
