//! The seam between the call session and the real-time media engine.
//!
//! The session only ever hands the engine opaque descriptions and candidate
//! blobs; everything the engine reports back arrives as a [`PeerEvent`].

use std::sync::Arc;

use async_trait::async_trait;
use parley_shared::{CandidateBlob, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::track::MediaTrack;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection is closed")]
    Closed,
}

/// Asynchronous notifications from one peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local connectivity candidate to publish to the counterpart.
    LocalCandidate(CandidateBlob),
    /// A track the counterpart sends.
    RemoteTrack(Arc<MediaTrack>),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_candidate(&self, candidate: CandidateBlob) -> Result<(), PeerError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self);
}

/// Builds a fresh peer connection for every call attempt.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
