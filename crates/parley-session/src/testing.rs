//! In-process fakes for driving sessions without a media engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_media::{
    DeviceCapabilities, LocalStream, MediaConstraints, MediaDevices, MediaError, MediaTrack, PeerConnection,
    PeerError, PeerEvent, PeerFactory, SyntheticDevices,
};
use parley_shared::{
    CallId, CallRecord, CallUpdate, CandidateBlob, CandidateItem, CandidateSide, ConversationId, PartyId,
    SessionDescription, TrackKind,
};
use parley_store::{CallFilter, SignalingChannel, SqliteChannel, StoreError, Subscription};
use tokio::sync::mpsc;

/// Records every peer it builds so tests can inspect them afterwards.
pub(crate) struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    label: &'static str,
}

impl FakePeerFactory {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            label,
        }
    }

    pub(crate) fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub(crate) fn last(&self) -> Arc<FakePeer> {
        self.peers().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            name: format!("{}-{}", self.label, peers.len()),
            events,
            local_tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        peers.push(peer.clone());
        Ok(peer)
    }
}

/// Produces a description named after itself plus one local candidate per
/// description, and reports a remote video track once the counterpart's
/// description is set.
pub(crate) struct FakePeer {
    name: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    local_tracks: Mutex<Vec<Arc<MediaTrack>>>,
    remote: Mutex<Option<SessionDescription>>,
    /// Every candidate handed in, with whether the remote description was
    /// set at the time.
    candidates: Mutex<Vec<(CandidateBlob, bool)>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl FakePeer {
    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<(CandidateBlob, bool)> {
        self.candidates.lock().unwrap().clone()
    }

    pub(crate) fn local_track_count(&self) -> usize {
        self.local_tracks.lock().unwrap().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn emit_candidate(&self) {
        let _ = self
            .events
            .send(PeerEvent::LocalCandidate(CandidateBlob::new(format!("cand-{}", self.name))));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: Arc<MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.local_tracks.lock().unwrap().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.emit_candidate();
        Ok(SessionDescription::offer(format!("offer-{}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.remote_description().is_none() {
            return Err(PeerError::InvalidDescription("no remote offer".to_string()));
        }
        self.emit_candidate();
        Ok(SessionDescription::answer(format!("answer-{}", self.name)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.remote.lock().unwrap() = Some(desc);
        let _ = self.events.send(PeerEvent::RemoteTrack(MediaTrack::new(TrackKind::Video)));
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }

    async fn add_candidate(&self, candidate: CandidateBlob) -> Result<(), PeerError> {
        self.ensure_open()?;
        let applied = self.remote.lock().unwrap().is_some();
        self.candidates.lock().unwrap().push((candidate, applied));
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Signaling channel whose record updates can be made to fail on demand.
pub(crate) struct FlakyChannel {
    inner: Arc<SqliteChannel>,
    fail_updates: AtomicBool,
}

impl FlakyChannel {
    pub(crate) fn new(inner: Arc<SqliteChannel>) -> Self {
        Self {
            inner,
            fail_updates: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for FlakyChannel {
    async fn create_call(&self, conversation: &ConversationId, created_by: &PartyId) -> parley_store::Result<CallRecord> {
        self.inner.create_call(conversation, created_by).await
    }

    async fn get_call(&self, id: &CallId) -> parley_store::Result<Option<CallRecord>> {
        self.inner.get_call(id).await
    }

    async fn update_call(&self, id: &CallId, update: CallUpdate) -> parley_store::Result<CallRecord> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("store unreachable")));
        }
        self.inner.update_call(id, update).await
    }

    async fn watch_calls(&self, filter: CallFilter) -> parley_store::Result<Subscription<CallRecord>> {
        self.inner.watch_calls(filter).await
    }

    async fn watch_call(&self, id: &CallId) -> parley_store::Result<Subscription<CallRecord>> {
        self.inner.watch_call(id).await
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: CandidateBlob,
    ) -> parley_store::Result<u64> {
        self.inner.append_candidate(id, side, candidate).await
    }

    async fn watch_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> parley_store::Result<Subscription<CandidateItem>> {
        self.inner.watch_candidates(id, side).await
    }
}

/// Devices whose first `grants` opens succeed and every later open waits on
/// a permission prompt nobody answers.
pub(crate) struct PromptingDevices {
    inner: SyntheticDevices,
    grants: usize,
    opens: AtomicUsize,
}

impl PromptingDevices {
    pub(crate) fn new(grants: usize) -> Self {
        Self {
            inner: SyntheticDevices::with_camera_and_mic(),
            grants,
            opens: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaDevices for PromptingDevices {
    async fn probe(&self) -> Result<DeviceCapabilities, MediaError> {
        self.inner.probe().await
    }

    async fn open(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if self.opens.fetch_add(1, Ordering::SeqCst) >= self.grants {
            std::future::pending::<()>().await;
        }
        self.inner.open(constraints).await
    }
}
