use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parley_shared::TrackKind;
use tracing::debug;

/// One audio or video track.
///
/// `enabled` is the mute/camera-off switch: a disabled track keeps flowing
/// (silence / black frames) so toggling never renegotiates. `stopped` is
/// final.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            debug!(track = %self.id, kind = self.kind.as_str(), "Track stopped");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// The local capture stream handed out by the media gateway.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// `true` when every track of `kind` is enabled (vacuously for none).
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).all(|t| t.is_enabled())
    }

    /// Flip every track of `kind`. Returns the new state, or `None` if the
    /// stream has no such track.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        if !self.has(kind) {
            return None;
        }
        let next = !self.is_enabled(kind);
        for track in self.tracks_of(kind) {
            track.set_enabled(next);
        }
        Some(next)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Container the peer connection's remote tracks are collected into.
#[derive(Debug, Default)]
pub struct RemoteStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&mut self, track: Arc<MediaTrack>) {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return;
        }
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
