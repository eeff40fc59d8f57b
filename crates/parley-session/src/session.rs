//! The call session: one actor task per open call surface.
//!
//! [`spawn_session`] starts the task and returns a [`SessionHandle`]. The
//! task owns every resource of the current attempt (peer connection, media,
//! timer, watch subscriptions) and processes user commands and store/engine
//! notifications strictly one at a time, so no two handlers ever interleave.
//! Nothing fails across the handle: outcomes are published as a
//! [`SessionView`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use parley_media::{
    DeviceCapabilities, LocalStream, MediaError, MediaGateway, PeerConnection, PeerError, PeerEvent,
    PeerFactory, RemoteStream,
};
use parley_shared::constants::{STATUS_CANCELLED, STATUS_DECLINED, STATUS_ENDED, STATUS_NOT_ANSWERED};
use parley_shared::{
    CallError, CallId, CallRecord, CallStatus, CallUpdate, CandidateItem, CandidateSide, ConversationId,
    PartyId, TrackKind,
};
use parley_store::{CallFilter, SignalingChannel, StoreError};

use crate::config::SessionConfig;
use crate::event::{AttemptId, SessionEvent};
use crate::expiry::ExpiryTimer;
use crate::incoming::IncomingWatcher;
use crate::relay::CandidateRelay;
use crate::subscriptions::SubscriptionSet;

// ---------------------------------------------------------------------------
// Observable surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Idle,
    Previewing,
    Calling,
    Incoming,
    InCall,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Previewing => "previewing",
            Self::Calling => "calling",
            Self::Incoming => "incoming",
            Self::InCall => "in-call",
        }
    }
}

/// What the surrounding UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub step: StepKind,
    pub call_id: Option<CallId>,
    pub has_camera: bool,
    pub has_microphone: bool,
    pub microphone_on: bool,
    pub camera_on: bool,
    /// Outcome of the last attempt ("Call declined", ...).
    pub status_message: Option<String>,
    pub error: Option<String>,
    pub remote_has_video: bool,
    pub closed: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            step: StepKind::Idle,
            call_id: None,
            has_camera: false,
            has_microphone: false,
            microphone_on: false,
            camera_on: false,
            status_message: None,
            error: None,
            remote_has_video: false,
            closed: false,
        }
    }
}

/// Resource accounting, used to prove nothing outlives an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub step: StepKind,
    pub armed_timers: usize,
    /// Live forwarding tasks owned by the current attempt or incoming call.
    pub subscriptions: usize,
    pub incoming_watcher: bool,
    /// A start or accept is waiting on local media.
    pub acquiring_media: bool,
    pub has_peer: bool,
    pub call_id: Option<CallId>,
}

/// Everything a session needs from its surroundings.
pub struct SessionContext {
    pub conversation: ConversationId,
    pub local: PartyId,
    pub channel: Arc<dyn SignalingChannel>,
    pub media: MediaGateway,
    pub peers: Arc<dyn PeerFactory>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Accept,
    Reject,
    End,
    ToggleMicrophone,
    ToggleCamera,
    Close,
}

enum SessionCommand {
    Action(Action, oneshot::Sender<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
}

/// Control surface of a running session. Cheap to clone.
///
/// Every method returns once the session has processed the request. After
/// the session is closed, requests are ignored.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    pub async fn start(&self) {
        self.act(Action::Start).await
    }

    pub async fn accept(&self) {
        self.act(Action::Accept).await
    }

    pub async fn reject(&self) {
        self.act(Action::Reject).await
    }

    pub async fn end(&self) {
        self.act(Action::End).await
    }

    pub async fn toggle_microphone(&self) {
        self.act(Action::ToggleMicrophone).await
    }

    pub async fn toggle_camera(&self) {
        self.act(Action::ToggleCamera).await
    }

    pub async fn close(&self) {
        self.act(Action::Close).await
    }

    /// `None` once the session is closed.
    pub async fn diagnostics(&self) -> Option<Diagnostics> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(SessionCommand::Diagnostics(tx)).ok()?;
        rx.await.ok()
    }

    /// Latest published view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// A receiver that wakes on every view change.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    async fn act(&self, action: Action) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Action(action, tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// Spawn a session task and return its handle.
///
/// The task probes and acquires media in the background, watches for
/// incoming calls right away, and runs until [`SessionHandle::close`] or
/// until every handle is dropped.
pub fn spawn_session(ctx: SessionContext) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(SessionView::default());

    let session = CallSession::new(ctx, events_tx, view_tx);
    tokio::spawn(session.run(cmd_rx, events_rx));

    SessionHandle {
        commands: cmd_tx,
        view: view_rx,
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The candidate sequence this side appends to.
    fn local_side(self) -> CandidateSide {
        match self {
            Self::Caller => CandidateSide::Offer,
            Self::Callee => CandidateSide::Answer,
        }
    }
}

/// One call attempt with a peer connection.
struct Attempt {
    id: AttemptId,
    record: CallRecord,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    subscriptions: SubscriptionSet,
    relay: CandidateRelay,
}

/// A ringing call shown to the user, before any peer connection exists.
struct IncomingCall {
    id: AttemptId,
    call_id: CallId,
    subscriptions: SubscriptionSet,
    /// Set once the user accepted and the answer waits on local media.
    media: Option<PendingMedia>,
}

/// Media acquisition a start or accept is waiting on. Dropping it abandons
/// the acquisition.
struct PendingMedia {
    id: AttemptId,
    task: AbortHandle,
}

impl Drop for PendingMedia {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Step {
    Idle,
    Previewing,
    /// Previewing with a start waiting on local media.
    Preparing(PendingMedia),
    /// `timer` is `None` once it fired and lost the race to an answer.
    Calling {
        attempt: Attempt,
        timer: Option<ExpiryTimer>,
    },
    Incoming(IncomingCall),
    InCall(Attempt),
}

impl Step {
    fn kind(&self) -> StepKind {
        match self {
            Self::Idle => StepKind::Idle,
            Self::Previewing | Self::Preparing(_) => StepKind::Previewing,
            Self::Calling { .. } => StepKind::Calling,
            Self::Incoming(_) => StepKind::Incoming,
            Self::InCall(_) => StepKind::InCall,
        }
    }

    fn is_standby(&self) -> bool {
        matches!(self, Self::Idle | Self::Previewing | Self::Preparing(_))
    }

    fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Calling { attempt, .. } | Self::InCall(attempt) => Some(attempt.record.id),
            Self::Incoming(incoming) => Some(incoming.call_id),
            Self::Idle | Self::Previewing | Self::Preparing(_) => None,
        }
    }

    /// The record id of a call this party is actively part of.
    fn live_call(&self) -> Option<CallId> {
        match self {
            Self::Calling { attempt, .. } | Self::InCall(attempt) => Some(attempt.record.id),
            _ => None,
        }
    }

    fn attempt_mut(&mut self, id: AttemptId) -> Option<&mut Attempt> {
        match self {
            Self::Calling { attempt, .. } | Self::InCall(attempt) if attempt.id == id => Some(attempt),
            _ => None,
        }
    }

    fn subscription_count(&self) -> usize {
        match self {
            Self::Calling { attempt, .. } | Self::InCall(attempt) => attempt.subscriptions.len(),
            Self::Incoming(incoming) => incoming.subscriptions.len(),
            Self::Idle | Self::Previewing | Self::Preparing(_) => 0,
        }
    }

    fn is_acquiring(&self) -> bool {
        match self {
            Self::Preparing(_) => true,
            Self::Incoming(incoming) => incoming.media.is_some(),
            _ => false,
        }
    }
}

fn read_failure(err: StoreError) -> CallError {
    CallError::SignalingReadFailure(err.to_string())
}

fn write_failure(err: StoreError) -> CallError {
    CallError::SignalingWriteFailure(err.to_string())
}

fn peer_failure(err: PeerError) -> CallError {
    CallError::PeerConnection(err.to_string())
}

/// Status line for an attempt that ended in `status`. A caller hanging up
/// before the callee answered reads as a cancellation on the callee side.
fn outcome_message(status: CallStatus, before_answer: bool) -> Option<&'static str> {
    match status {
        CallStatus::Rejected => Some(STATUS_DECLINED),
        CallStatus::NotAnswered => Some(STATUS_NOT_ANSWERED),
        CallStatus::Ended if before_answer => Some(STATUS_CANCELLED),
        CallStatus::Ended => Some(STATUS_ENDED),
        CallStatus::Ringing | CallStatus::Active => None,
    }
}

struct CallSession {
    conversation: ConversationId,
    local: PartyId,
    channel: Arc<dyn SignalingChannel>,
    media: MediaGateway,
    peers: Arc<dyn PeerFactory>,
    config: SessionConfig,

    step: Step,
    local_stream: Option<LocalStream>,
    remote: RemoteStream,
    caps: DeviceCapabilities,
    microphone_on: bool,
    camera_on: bool,
    status_message: Option<String>,
    error: Option<String>,

    watcher: Option<IncomingWatcher>,
    /// Calls this party answered; never surfaced as incoming again.
    answered: HashSet<CallId>,
    next_attempt: u64,
    next_epoch: u64,
    timers: Arc<AtomicUsize>,
    closed: bool,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    view_tx: watch::Sender<SessionView>,
}

impl CallSession {
    fn new(
        ctx: SessionContext,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        view_tx: watch::Sender<SessionView>,
    ) -> Self {
        Self {
            conversation: ctx.conversation,
            local: ctx.local,
            channel: ctx.channel,
            media: ctx.media,
            peers: ctx.peers,
            config: ctx.config,
            step: Step::Idle,
            local_stream: None,
            remote: RemoteStream::new(),
            caps: DeviceCapabilities::none(),
            microphone_on: false,
            camera_on: false,
            status_message: None,
            error: None,
            watcher: None,
            answered: HashSet::new(),
            next_attempt: 0,
            next_epoch: 0,
            timers: Arc::new(AtomicUsize::new(0)),
            closed: false,
            events_tx,
            view_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        info!(party = %self.local.short(), conversation = %self.conversation, "Call session started");

        self.begin_media();
        self.ensure_watcher().await;
        self.publish();

        while !self.closed {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Action(action, ack)) => {
                        debug!(?action, step = self.step.kind().as_str(), "Command");
                        self.handle_action(action).await;
                        self.publish();
                        let _ = ack.send(());
                    }
                    Some(SessionCommand::Diagnostics(reply)) => {
                        let _ = reply.send(self.diagnostics());
                    }
                    None => {
                        info!("All session handles dropped");
                        self.close().await;
                        self.publish();
                    }
                },
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                    self.publish();
                }
            }
        }

        info!(party = %self.local.short(), "Call session stopped");
    }

    fn allocate_attempt(&mut self) -> AttemptId {
        self.next_attempt += 1;
        AttemptId(self.next_attempt)
    }

    fn snapshot(&self) -> SessionView {
        SessionView {
            step: self.step.kind(),
            call_id: self.step.call_id(),
            has_camera: self.caps.has_camera,
            has_microphone: self.caps.has_microphone,
            microphone_on: self.microphone_on,
            camera_on: self.camera_on,
            status_message: self.status_message.clone(),
            error: self.error.clone(),
            remote_has_video: self.remote.has_video(),
            closed: self.closed,
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.step != next.step {
                info!(
                    party = %self.local.short(),
                    from = current.step.as_str(),
                    to = next.step.as_str(),
                    call = ?next.call_id.map(|id| id.short()),
                    "Step changed"
                );
            }
            *current = next;
            true
        });
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            step: self.step.kind(),
            armed_timers: self.timers.load(Ordering::SeqCst),
            subscriptions: self.step.subscription_count(),
            incoming_watcher: self.watcher.is_some(),
            acquiring_media: self.step.is_acquiring(),
            has_peer: matches!(self.step, Step::Calling { .. } | Step::InCall(_)),
            call_id: self.step.call_id(),
        }
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    fn begin_media(&self) {
        self.spawn_acquire(None);
    }

    /// Probe and acquire on a separate task so a permission prompt never
    /// blocks the session loop. The result comes back as `MediaReady`.
    fn spawn_acquire(&self, attempt: Option<AttemptId>) -> AbortHandle {
        let media = self.media.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let caps = media.probe().await;
            let result = media.acquire(caps).await;
            if let Err(mpsc::error::SendError(SessionEvent::MediaReady { result: Ok(stream), .. })) =
                events.send(SessionEvent::MediaReady { attempt, caps, result })
            {
                stream.stop_all();
            }
        })
        .abort_handle()
    }

    fn pending_media(&mut self) -> PendingMedia {
        let id = self.allocate_attempt();
        debug!(attempt = %id, "Acquiring local media");
        PendingMedia {
            id,
            task: self.spawn_acquire(Some(id)),
        }
    }

    fn adopt_stream(&mut self, stream: LocalStream) {
        self.caps = DeviceCapabilities::of_stream(&stream);
        self.microphone_on = self.caps.has_microphone && stream.is_enabled(TrackKind::Audio);
        self.camera_on = self.caps.has_camera && stream.is_enabled(TrackKind::Video);
        self.local_stream = Some(stream);
    }

    /// Keep an acquisition result. A stream arriving while one is already
    /// held is released.
    fn take_media(
        &mut self,
        caps: DeviceCapabilities,
        result: Result<LocalStream, MediaError>,
    ) -> Result<(), MediaError> {
        match result {
            Ok(stream) if self.local_stream.is_some() => {
                self.media.release(&stream);
                Ok(())
            }
            Ok(stream) => {
                self.adopt_stream(stream);
                Ok(())
            }
            Err(e) => {
                self.caps = caps;
                Err(e)
            }
        }
    }

    fn release_media(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            self.media.release(&stream);
        }
        self.microphone_on = false;
        self.camera_on = false;
        self.remote.stop_all();
    }

    fn toggle(&mut self, kind: TrackKind) {
        let Some(stream) = &self.local_stream else {
            debug!(kind = kind.as_str(), "No local media to toggle");
            return;
        };
        match (kind, self.media.toggle(stream, kind)) {
            (TrackKind::Audio, Some(on)) => self.microphone_on = on,
            (TrackKind::Video, Some(on)) => self.camera_on = on,
            (_, None) => debug!(kind = kind.as_str(), "No track of that kind"),
        }
    }

    // -----------------------------------------------------------------------
    // Standby and cleanup
    // -----------------------------------------------------------------------

    /// Make sure the incoming watcher runs while idle or previewing.
    async fn ensure_watcher(&mut self) {
        if self.closed || self.watcher.is_some() || !self.step.is_standby() {
            return;
        }
        self.next_epoch += 1;
        match IncomingWatcher::start(
            &self.channel,
            &self.conversation,
            &self.local,
            self.config.stale_ringing_age(),
            self.next_epoch,
            &self.events_tx,
        )
        .await
        {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(e) => {
                warn!(error = %e, "Failed to watch for incoming calls");
                if self.error.is_none() {
                    self.error = Some(read_failure(e).to_string());
                }
            }
        }
    }

    /// Release everything the current step holds and fall back to
    /// previewing. Safe to call any number of times.
    ///
    /// Order: timer, subscriptions, local and remote tracks, peer
    /// connection, remote stream container. The record id goes with the
    /// step.
    async fn cleanup(&mut self) {
        let step = std::mem::replace(&mut self.step, Step::Previewing);
        let peer = match step {
            Step::Calling {
                mut attempt,
                timer,
            } => {
                drop(timer);
                attempt.subscriptions.cancel_all();
                Some(attempt.peer)
            }
            Step::InCall(mut attempt) => {
                attempt.subscriptions.cancel_all();
                Some(attempt.peer)
            }
            Step::Incoming(mut incoming) => {
                incoming.subscriptions.cancel_all();
                None
            }
            Step::Previewing | Step::Preparing(_) => None,
            Step::Idle => {
                self.step = Step::Idle;
                None
            }
        };

        self.release_media();
        if let Some(peer) = peer {
            peer.close().await;
        }
        self.remote = RemoteStream::new();
    }

    /// Write a terminal status. A record that is already terminal counts as
    /// success.
    async fn write_final(&self, call_id: CallId, status: CallStatus) -> Result<(), StoreError> {
        match self.channel.update_call(&call_id, CallUpdate::status(status)).await {
            Ok(_) => Ok(()),
            Err(StoreError::IllegalTransition { from, .. }) => {
                debug!(call = %call_id.short(), %from, %status, "Record already final");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Abort the current attempt with `err`. `abandon` names a record this
    /// party created, which is marked `ended` so the callee stops ringing.
    async fn fail_attempt(&mut self, abandon: Option<CallId>, err: CallError) {
        warn!(error = %err, "Call attempt failed");
        self.cleanup().await;
        if let Some(call_id) = abandon {
            if let Err(e) = self.write_final(call_id, CallStatus::Ended).await {
                warn!(call = %call_id.short(), error = %e, "Failed to abandon call record");
            }
        }
        self.error = Some(err.to_string());
        self.ensure_watcher().await;
    }

    /// Tear down and return to previewing with an outcome line.
    async fn finish(&mut self, message: Option<&str>) {
        self.cleanup().await;
        self.status_message = message.map(str::to_string);
        self.ensure_watcher().await;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_action(&mut self, action: Action) {
        if self.closed {
            return;
        }
        match action {
            Action::Start => self.start().await,
            Action::Accept => self.accept().await,
            Action::Reject => self.reject().await,
            Action::End => self.end().await,
            Action::ToggleMicrophone => self.toggle(TrackKind::Audio),
            Action::ToggleCamera => self.toggle(TrackKind::Video),
            Action::Close => self.close().await,
        }
    }

    async fn start(&mut self) {
        if !matches!(self.step, Step::Previewing) {
            debug!(step = self.step.kind().as_str(), "start ignored");
            return;
        }
        self.error = None;
        self.status_message = None;

        if self.local_stream.is_none() {
            let pending = self.pending_media();
            self.step = Step::Preparing(pending);
            return;
        }
        self.place_new_call().await;
    }

    /// Create the record and dial. Runs once local media is in hand.
    async fn place_new_call(&mut self) {
        let Some(stream) = self.local_stream.clone().filter(|s| !s.is_empty()) else {
            self.error = Some(CallError::MediaUnavailable.to_string());
            return;
        };

        self.watcher = None;
        let record = match self.channel.create_call(&self.conversation, &self.local).await {
            Ok(record) => record,
            Err(e) => {
                self.fail_attempt(None, write_failure(e)).await;
                return;
            }
        };

        let call_id = record.id;
        match self.place_call(record, &stream).await {
            Ok(()) => info!(call = %call_id.short(), "Calling"),
            Err(err) => self.fail_attempt(Some(call_id), err).await,
        }
    }

    /// Fresh peer connection and remote stream for a new attempt.
    async fn new_attempt(&mut self, record: CallRecord, role: Role) -> Result<Attempt, CallError> {
        let id = self.allocate_attempt();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = self.peers.create(peer_tx).await.map_err(peer_failure)?;

        let mut subscriptions = SubscriptionSet::new();
        subscriptions.forward_channel(peer_rx, &self.events_tx, move |event| SessionEvent::Peer {
            attempt: id,
            event,
        });
        self.remote = RemoteStream::new();

        debug!(attempt = %id, call = %record.id.short(), ?role, "Attempt created");
        Ok(Attempt {
            id,
            record,
            role,
            peer,
            subscriptions,
            relay: CandidateRelay::new(),
        })
    }

    async fn place_call(&mut self, record: CallRecord, stream: &LocalStream) -> Result<(), CallError> {
        let call_id = record.id;
        let attempt = self.new_attempt(record, Role::Caller).await?;
        let id = attempt.id;
        let peer = attempt.peer.clone();
        self.step = Step::Calling { attempt, timer: None };

        for track in stream.tracks() {
            peer.add_local_track(track.clone()).await.map_err(peer_failure)?;
        }

        let record_watch = self.channel.watch_call(&call_id).await.map_err(read_failure)?;
        let answers = self
            .channel
            .watch_candidates(&call_id, Role::Caller.local_side().counterpart())
            .await
            .map_err(read_failure)?;
        let rivals = self
            .channel
            .watch_calls(
                CallFilter::new(self.conversation.clone(), &[CallStatus::Ringing]).excluding(self.local.clone()),
            )
            .await
            .map_err(read_failure)?;

        if let Some(attempt) = self.step.attempt_mut(id) {
            let events = &self.events_tx;
            attempt.subscriptions.forward(record_watch, events, move |record| SessionEvent::RecordChanged {
                attempt: id,
                record,
            });
            attempt.subscriptions.forward(answers, events, move |item| SessionEvent::RemoteCandidate {
                attempt: id,
                item,
            });
            attempt.subscriptions.forward(rivals, events, move |record| SessionEvent::Glare {
                attempt: id,
                record,
            });
        }

        let offer = peer.create_offer().await.map_err(peer_failure)?;
        self.channel
            .update_call(&call_id, CallUpdate::offer(offer))
            .await
            .map_err(write_failure)?;

        let events = self.events_tx.clone();
        let timer = ExpiryTimer::arm(self.config.unanswered_timeout, &self.timers, move || {
            let _ = events.send(SessionEvent::TimerFired { attempt: id });
        });
        if let Step::Calling { timer: slot, .. } = &mut self.step {
            *slot = Some(timer);
        }
        Ok(())
    }

    async fn accept(&mut self) {
        let call_id = match &self.step {
            Step::Incoming(incoming) if incoming.media.is_none() => incoming.call_id,
            _ => {
                debug!(step = self.step.kind().as_str(), "accept ignored");
                return;
            }
        };
        self.error = None;
        self.status_message = None;

        if self.local_stream.is_none() {
            // Keep ringing, and watching for a hang-up, until media arrives.
            let pending = self.pending_media();
            if let Step::Incoming(incoming) = &mut self.step {
                incoming.media = Some(pending);
            }
            return;
        }
        self.answer_incoming(call_id).await;
    }

    async fn answer_incoming(&mut self, call_id: CallId) {
        // Drop the incoming call's watch; the attempt opens its own.
        self.step = Step::Previewing;

        match self.answer_call(call_id).await {
            Ok(()) => {
                self.answered.insert(call_id);
                info!(call = %call_id.short(), "Call answered");
            }
            Err(err) => self.fail_attempt(None, err).await,
        }
    }

    async fn answer_call(&mut self, call_id: CallId) -> Result<(), CallError> {
        let record = match self.channel.get_call(&call_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(CallError::SignalingReadFailure("call record vanished".to_string())),
            Err(e) => return Err(read_failure(e)),
        };
        if record.created_by == self.local {
            return Err(CallError::ProtocolViolation("cannot answer a call this party created".to_string()));
        }
        if record.status.is_terminal() {
            return Err(CallError::ProtocolViolation("call is no longer available".to_string()));
        }
        if record.answer.is_some() {
            return Err(CallError::ProtocolViolation("call was already answered".to_string()));
        }
        let Some(offer) = record.offer.clone() else {
            return Err(CallError::ProtocolViolation("call has no offer".to_string()));
        };

        let attempt = self.new_attempt(record, Role::Callee).await?;
        let id = attempt.id;
        let peer = attempt.peer.clone();
        self.step = Step::InCall(attempt);

        if let Some(stream) = self.local_stream.clone() {
            for track in stream.tracks() {
                peer.add_local_track(track.clone()).await.map_err(peer_failure)?;
            }
        }

        let record_watch = self.channel.watch_call(&call_id).await.map_err(read_failure)?;
        let offers = self
            .channel
            .watch_candidates(&call_id, Role::Callee.local_side().counterpart())
            .await
            .map_err(read_failure)?;
        if let Some(attempt) = self.step.attempt_mut(id) {
            let events = &self.events_tx;
            attempt.subscriptions.forward(record_watch, events, move |record| SessionEvent::RecordChanged {
                attempt: id,
                record,
            });
            attempt.subscriptions.forward(offers, events, move |item| SessionEvent::RemoteCandidate {
                attempt: id,
                item,
            });
        }

        peer.set_remote_description(offer).await.map_err(peer_failure)?;
        self.flush_candidates(id).await;

        let answer = peer.create_answer().await.map_err(peer_failure)?;
        match self.channel.update_call(&call_id, CallUpdate::answered(answer)).await {
            Ok(_) => Ok(()),
            Err(StoreError::IllegalTransition { .. }) => {
                Err(CallError::ProtocolViolation("call is no longer available".to_string()))
            }
            Err(e) => Err(write_failure(e)),
        }
    }

    async fn reject(&mut self) {
        let call_id = match &self.step {
            Step::Incoming(incoming) => incoming.call_id,
            _ => {
                debug!(step = self.step.kind().as_str(), "reject ignored");
                return;
            }
        };

        self.cleanup().await;
        if let Err(e) = self.write_final(call_id, CallStatus::Rejected).await {
            warn!(call = %call_id.short(), error = %e, "Failed to reject call");
            self.error = Some(write_failure(e).to_string());
        }
        info!(call = %call_id.short(), "Call rejected");
        self.status_message = None;
        self.ensure_watcher().await;
    }

    async fn end(&mut self) {
        let Some(call_id) = self.step.live_call() else {
            debug!(step = self.step.kind().as_str(), "end ignored");
            return;
        };

        self.cleanup().await;
        if let Err(e) = self.write_final(call_id, CallStatus::Ended).await {
            warn!(call = %call_id.short(), error = %e, "Failed to end call");
            self.error = Some(write_failure(e).to_string());
        }
        info!(call = %call_id.short(), "Call ended locally");
        self.status_message = None;
        self.ensure_watcher().await;
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.watcher = None;

        let live = self.step.live_call();
        self.cleanup().await;
        if let Some(call_id) = live {
            if let Err(e) = self.write_final(call_id, CallStatus::Ended).await {
                warn!(call = %call_id.short(), error = %e, "Failed to end call on close");
            }
        }

        self.step = Step::Idle;
        self.closed = true;
        info!(party = %self.local.short(), "Call session closed");
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: SessionEvent) {
        if self.closed {
            return;
        }
        match event {
            SessionEvent::MediaReady { attempt, caps, result } => self.on_media_ready(attempt, caps, result).await,
            SessionEvent::Incoming { epoch, record } => self.on_incoming(epoch, record).await,
            SessionEvent::RecordChanged { attempt, record } => self.on_record(attempt, record).await,
            SessionEvent::RemoteCandidate { attempt, item } => self.on_remote_candidate(attempt, item).await,
            SessionEvent::Peer { attempt, event } => self.on_peer_event(attempt, event).await,
            SessionEvent::TimerFired { attempt } => self.on_timer(attempt).await,
            SessionEvent::Glare { attempt, record } => self.on_glare(attempt, record).await,
        }
    }

    async fn on_media_ready(
        &mut self,
        attempt: Option<AttemptId>,
        caps: DeviceCapabilities,
        result: Result<LocalStream, MediaError>,
    ) {
        let Some(id) = attempt else {
            if let Err(e) = self.take_media(caps, result) {
                let err = CallError::from(e);
                warn!(error = %err, "Previewing without local media");
                self.error = Some(err.to_string());
            }
            if matches!(self.step, Step::Idle) {
                self.step = Step::Previewing;
            }
            self.ensure_watcher().await;
            return;
        };

        let for_start = matches!(&self.step, Step::Preparing(pending) if pending.id == id);
        let for_answer = match &self.step {
            Step::Incoming(IncomingCall {
                media: Some(pending),
                call_id,
                ..
            }) if pending.id == id => Some(*call_id),
            _ => None,
        };

        if for_start {
            self.step = Step::Previewing;
            match self.take_media(caps, result) {
                Ok(()) => self.place_new_call().await,
                Err(e) => self.error = Some(CallError::from(e).to_string()),
            }
        } else if let Some(call_id) = for_answer {
            if let Err(e) = self.take_media(caps, result) {
                warn!(error = %e, "Answering without local media");
            }
            self.answer_incoming(call_id).await;
        } else {
            trace!(attempt = %id, "Stale media dropped");
            if let Ok(stream) = result {
                self.media.release(&stream);
            }
        }
    }

    async fn on_incoming(&mut self, epoch: u64, record: CallRecord) {
        if self.watcher.as_ref().map(IncomingWatcher::epoch) != Some(epoch) || !self.step.is_standby() {
            trace!(epoch, "Stale incoming notification dropped");
            return;
        }
        if self.answered.contains(&record.id) {
            trace!(call = %record.id.short(), "Already answered, not surfacing");
            return;
        }
        self.watcher = None;
        self.enter_incoming(record).await;
    }

    async fn enter_incoming(&mut self, record: CallRecord) {
        let id = self.allocate_attempt();
        let mut subscriptions = SubscriptionSet::new();
        match self.channel.watch_call(&record.id).await {
            Ok(sub) => subscriptions.forward(sub, &self.events_tx, move |record| SessionEvent::RecordChanged {
                attempt: id,
                record,
            }),
            Err(e) => {
                warn!(call = %record.id.short(), error = %e, "Failed to watch incoming call");
                self.error = Some(read_failure(e).to_string());
                self.ensure_watcher().await;
                return;
            }
        }

        info!(call = %record.id.short(), from = %record.created_by.short(), "Incoming call");
        self.status_message = None;
        self.step = Step::Incoming(IncomingCall {
            id,
            call_id: record.id,
            subscriptions,
            media: None,
        });
    }

    async fn on_record(&mut self, attempt: AttemptId, record: CallRecord) {
        match &self.step {
            Step::Calling { attempt: current, .. } if current.id == attempt => self.on_caller_record(record).await,
            Step::InCall(current) if current.id == attempt => self.on_in_call_record(record).await,
            Step::Incoming(incoming) if incoming.id == attempt => self.on_incoming_record(record).await,
            _ => trace!(%attempt, "Stale record snapshot dropped"),
        }
    }

    async fn on_caller_record(&mut self, record: CallRecord) {
        if record.status.is_terminal() {
            info!(call = %record.id.short(), status = %record.status, "Call closed by the other party");
            self.finish(outcome_message(record.status, false)).await;
            return;
        }

        let Some(answer) = record.answer else { return };
        let Step::Calling { attempt, timer } = &mut self.step else { return };
        if attempt.peer.has_remote_description().await {
            // Duplicate delivery of a snapshot already applied.
            return;
        }
        *timer = None;

        let id = attempt.id;
        let peer = attempt.peer.clone();
        if let Err(e) = peer.set_remote_description(answer).await {
            self.fail_attempt(Some(record.id), peer_failure(e)).await;
            return;
        }

        if let Step::Calling { attempt, .. } = std::mem::replace(&mut self.step, Step::Previewing) {
            self.step = Step::InCall(attempt);
        }
        self.flush_candidates(id).await;
        info!(call = %record.id.short(), "Call connected");
    }

    async fn on_in_call_record(&mut self, record: CallRecord) {
        if record.status.is_terminal() {
            info!(call = %record.id.short(), status = %record.status, "Call closed by the other party");
            self.finish(outcome_message(record.status, false)).await;
        }
    }

    async fn on_incoming_record(&mut self, record: CallRecord) {
        if record.status.is_terminal() {
            info!(call = %record.id.short(), status = %record.status, "Incoming call withdrawn");
            self.finish(outcome_message(record.status, true)).await;
        }
    }

    async fn flush_candidates(&mut self, id: AttemptId) {
        let Some(attempt) = self.step.attempt_mut(id) else { return };
        let queued = attempt.relay.remote_applied();
        if queued.is_empty() {
            return;
        }
        debug!(attempt = %id, count = queued.len(), "Flushing queued candidates");
        let peer = attempt.peer.clone();
        for candidate in queued {
            if let Err(e) = peer.add_candidate(candidate).await {
                warn!(attempt = %id, error = %e, "Remote candidate rejected");
            }
        }
    }

    async fn on_remote_candidate(&mut self, id: AttemptId, item: CandidateItem) {
        let Some(attempt) = self.step.attempt_mut(id) else {
            trace!(attempt = %id, seq = item.seq, "Stale candidate dropped");
            return;
        };
        let Some(candidate) = attempt.relay.receive(item) else { return };
        let peer = attempt.peer.clone();
        if let Err(e) = peer.add_candidate(candidate).await {
            warn!(attempt = %id, error = %e, "Remote candidate rejected");
        }
    }

    async fn on_peer_event(&mut self, id: AttemptId, event: PeerEvent) {
        let Some(attempt) = self.step.attempt_mut(id) else {
            if let PeerEvent::RemoteTrack(track) = event {
                track.stop();
            }
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let call_id = attempt.record.id;
                let side = attempt.role.local_side();
                if let Err(e) = self.channel.append_candidate(&call_id, side, candidate).await {
                    warn!(call = %call_id.short(), side = side.as_str(), error = %e, "Failed to publish local candidate");
                }
            }
            PeerEvent::RemoteTrack(track) => {
                debug!(attempt = %id, kind = track.kind().as_str(), "Remote track added");
                self.remote.add_track(track);
            }
        }
    }

    async fn on_timer(&mut self, id: AttemptId) {
        let call_id = match &self.step {
            Step::Calling { attempt, .. } if attempt.id == id => attempt.record.id,
            _ => return,
        };

        match self
            .channel
            .update_call(&call_id, CallUpdate::status(CallStatus::NotAnswered))
            .await
        {
            Ok(_) => {
                info!(call = %call_id.short(), "Call not answered");
                self.finish(Some(STATUS_NOT_ANSWERED)).await;
            }
            Err(StoreError::IllegalTransition { from, .. }) => {
                // The snapshot carrying the answer or the hang-up is queued.
                debug!(call = %call_id.short(), %from, "Timer lost the race");
                if let Step::Calling { timer, .. } = &mut self.step {
                    *timer = None;
                }
            }
            Err(e) => self.fail_attempt(Some(call_id), write_failure(e)).await,
        }
    }

    async fn on_glare(&mut self, id: AttemptId, rival: CallRecord) {
        let own = match &self.step {
            Step::Calling { attempt, .. } if attempt.id == id => attempt.record.clone(),
            _ => return,
        };
        if rival.id == own.id || rival.created_by == self.local {
            return;
        }
        if rival.is_stale_ringing(Utc::now(), self.config.stale_ringing_age()) {
            trace!(call = %rival.id.short(), "Stale rival ignored");
            return;
        }
        if !rival.precedes(&own) {
            debug!(ours = %own.id.short(), theirs = %rival.id.short(), "Glare: our call stands");
            return;
        }

        info!(ours = %own.id.short(), theirs = %rival.id.short(), "Glare: yielding to the earlier call");
        self.cleanup().await;
        if let Err(e) = self.write_final(own.id, CallStatus::Ended).await {
            warn!(call = %own.id.short(), error = %e, "Failed to withdraw call");
        }
        self.enter_incoming(rival).await;
    }
}
