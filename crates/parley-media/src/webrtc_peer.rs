use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parley_shared::constants::DEFAULT_STUN_URL;
use parley_shared::{CandidateBlob, SdpType, SessionDescription, TrackKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::{PeerConnection, PeerError, PeerEvent, PeerFactory};
use crate::track::MediaTrack;

const STREAM_ID: &str = "parley";

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_URL.to_string()],
        }
    }
}

/// [`PeerFactory`] over the `webrtc` crate.
pub struct WebRtcPeerFactory {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await.map_err(engine)?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(CandidateBlob::new(json)));
                    }
                    Ok(Err(e)) => warn!("Failed to encode local candidate: {e}"),
                    Err(e) => warn!("Failed to read local candidate: {e}"),
                }
            })
        }));

        let track_tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            debug!(kind = kind.as_str(), "Remote track arrived");
            let _ = track_tx.send(PeerEvent::RemoteTrack(MediaTrack::new(kind)));
            Box::pin(async {})
        }));

        info!("Peer connection created");
        Ok(Arc::new(WebRtcPeer {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;

        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine)?;
        debug!(track = track.id(), kind = track.kind().as_str(), "Local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(engine)?;
        self.pc.set_local_description(offer.clone()).await.map_err(engine)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(engine)?;
        self.pc.set_local_description(answer.clone()).await.map_err(engine)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| PeerError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::InvalidDescription(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_candidate(&self, candidate: CandidateBlob) -> Result<(), PeerError> {
        self.ensure_open()?;
        let init: RTCIceCandidateInit = serde_json::from_str(candidate.as_str())
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Peer connection close failed: {e}");
        }
        debug!("Peer connection closed");
    }
}

fn engine(err: webrtc::Error) -> PeerError {
    PeerError::Engine(err.to_string())
}
