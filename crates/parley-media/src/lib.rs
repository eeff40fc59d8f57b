pub mod devices;
pub mod gateway;
#[cfg(feature = "host-audio")]
pub mod host_audio;
pub mod peer;
pub mod track;
pub mod webrtc_peer;

pub use devices::{DeviceCapabilities, MediaConstraints, MediaDevices, MediaError, SyntheticDevices};
pub use gateway::MediaGateway;
#[cfg(feature = "host-audio")]
pub use host_audio::HostAudioDevices;
pub use peer::{PeerConnection, PeerError, PeerEvent, PeerFactory};
pub use track::{LocalStream, MediaTrack, RemoteStream};
pub use webrtc_peer::{WebRtcConfig, WebRtcPeer, WebRtcPeerFactory};
