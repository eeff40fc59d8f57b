//! Two sessions talking through one in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_media::{DeviceCapabilities, MediaDevices, MediaError, MediaGateway, SyntheticDevices};
use parley_shared::constants::{STATUS_CANCELLED, STATUS_DECLINED, STATUS_ENDED, STATUS_NOT_ANSWERED};
use parley_shared::{
    CallId, CallRecord, CallStatus, CallUpdate, CandidateBlob, CandidateSide, ConversationId, PartyId,
    SessionDescription,
};
use parley_store::{SignalingChannel, SqliteChannel};

use crate::session::{spawn_session, SessionContext, SessionHandle, SessionView, StepKind};
use crate::testing::{FakePeerFactory, FlakyChannel, PromptingDevices};
use crate::SessionConfig;

fn room() -> ConversationId {
    ConversationId::new("room-1")
}

struct Party {
    handle: SessionHandle,
    peers: Arc<FakePeerFactory>,
}

fn join(channel: Arc<dyn SignalingChannel>, name: &'static str, devices: SyntheticDevices) -> Party {
    join_with(channel, name, Arc::new(devices))
}

fn join_with(channel: Arc<dyn SignalingChannel>, name: &'static str, devices: Arc<dyn MediaDevices>) -> Party {
    let peers = Arc::new(FakePeerFactory::new(name));
    let handle = spawn_session(SessionContext {
        conversation: room(),
        local: PartyId::new(name),
        channel,
        media: MediaGateway::new(devices),
        peers: peers.clone(),
        config: SessionConfig::default(),
    });
    Party { handle, peers }
}

fn pair() -> (Arc<SqliteChannel>, Party, Party) {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = join(store.clone(), "alice", SyntheticDevices::with_camera_and_mic());
    let bob = join(store.clone(), "bob", SyntheticDevices::with_camera_and_mic());
    (store, alice, bob)
}

/// Let every queued notification run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn wait_for(handle: &SessionHandle, what: &str, pred: impl FnMut(&SessionView) -> bool) -> SessionView {
    let mut rx = handle.subscribe();
    let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}, last view: {:?}", handle.view()))
        .expect("session task gone");
    view.clone()
}

async fn wait_step(handle: &SessionHandle, step: StepKind) -> SessionView {
    wait_for(handle, step.as_str(), |v| v.step == step).await
}

async fn record(store: &SqliteChannel, id: CallId) -> CallRecord {
    store.get_call(&id).await.unwrap().expect("record exists")
}

/// Alice calls, Bob answers. Returns the call id.
async fn connect(alice: &Party, bob: &Party) -> CallId {
    wait_step(&alice.handle, StepKind::Previewing).await;
    wait_step(&bob.handle, StepKind::Previewing).await;

    alice.handle.start().await;
    let call_id = alice.handle.view().call_id.expect("calling has a record");
    wait_step(&bob.handle, StepKind::Incoming).await;
    bob.handle.accept().await;
    wait_step(&alice.handle, StepKind::InCall).await;
    assert_eq!(bob.handle.view().step, StepKind::InCall);
    call_id
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let (store, alice, _bob) = pair();

    wait_step(&alice.handle, StepKind::Previewing).await;
    alice.handle.start().await;
    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Calling);
    let call_id = view.call_id.unwrap();

    let diag = alice.handle.diagnostics().await.unwrap();
    assert_eq!(diag.armed_timers, 1);

    tokio::time::sleep(Duration::from_millis(31_000)).await;

    let view = wait_step(&alice.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_NOT_ANSWERED));
    assert_eq!(view.call_id, None);
    assert_eq!(record(&store, call_id).await.status, CallStatus::NotAnswered);

    let diag = alice.handle.diagnostics().await.unwrap();
    assert_eq!(diag.armed_timers, 0);
    assert_eq!(diag.subscriptions, 0);
    assert!(!diag.has_peer);
    assert!(alice.peers.last().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_answer_connects_both_sides() {
    let (store, alice, bob) = pair();
    wait_step(&alice.handle, StepKind::Previewing).await;
    wait_step(&bob.handle, StepKind::Previewing).await;

    alice.handle.start().await;
    let call_id = alice.handle.view().call_id.unwrap();

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    let incoming = wait_step(&bob.handle, StepKind::Incoming).await;
    assert_eq!(incoming.call_id, Some(call_id));
    bob.handle.accept().await;

    let view = wait_step(&alice.handle, StepKind::InCall).await;
    assert_eq!(view.call_id, Some(call_id));
    assert_eq!(bob.handle.view().step, StepKind::InCall);

    let stored = record(&store, call_id).await;
    assert_eq!(stored.status, CallStatus::Active);
    assert_eq!(stored.offer.as_ref().map(|d| d.sdp.as_str()), Some("offer-alice-0"));
    assert_eq!(stored.answer.as_ref().map(|d| d.sdp.as_str()), Some("answer-bob-0"));

    assert_eq!(alice.handle.diagnostics().await.unwrap().armed_timers, 0);
    assert_eq!(alice.peers.last().remote_description(), stored.answer);
    assert_eq!(bob.peers.last().remote_description(), stored.offer);

    settle().await;
    let to_bob = bob.peers.last().candidates();
    assert_eq!(to_bob, vec![(CandidateBlob::new("cand-alice-0"), true)]);
    let to_alice = alice.peers.last().candidates();
    assert_eq!(to_alice, vec![(CandidateBlob::new("cand-bob-0"), true)]);
    assert!(alice.handle.view().remote_has_video);

    // The cancelled timer never fires.
    tokio::time::sleep(Duration::from_millis(30_000)).await;
    assert_eq!(alice.handle.view().step, StepKind::InCall);
    assert_eq!(record(&store, call_id).await.status, CallStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_reject_is_reported_as_declined() {
    let (store, alice, bob) = pair();
    wait_step(&alice.handle, StepKind::Previewing).await;
    wait_step(&bob.handle, StepKind::Previewing).await;

    alice.handle.start().await;
    let call_id = alice.handle.view().call_id.unwrap();
    wait_step(&bob.handle, StepKind::Incoming).await;
    bob.handle.reject().await;

    let view = wait_step(&alice.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_DECLINED));
    assert_eq!(record(&store, call_id).await.status, CallStatus::Rejected);

    assert_eq!(bob.handle.view().step, StepKind::Previewing);
    assert!(bob.peers.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_reaches_the_other_side() {
    let (store, alice, bob) = pair();
    let call_id = connect(&alice, &bob).await;

    // Whatever Bob is fiddling with locally does not matter.
    bob.handle.toggle_camera().await;
    alice.handle.end().await;

    assert_eq!(alice.handle.view().step, StepKind::Previewing);
    assert_eq!(record(&store, call_id).await.status, CallStatus::Ended);

    let view = wait_step(&bob.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_ENDED));
    assert!(bob.peers.last().is_closed());
    assert!(alice.peers.last().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_audio_only_device_calls_without_retry() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let devices = SyntheticDevices::new(DeviceCapabilities {
        has_camera: false,
        has_microphone: true,
    });
    let alice = join(store.clone(), "alice", devices);

    let view = wait_step(&alice.handle, StepKind::Previewing).await;
    assert_eq!(view.error, None);
    assert!(!view.has_camera);
    assert!(view.has_microphone);
    assert!(view.microphone_on);

    alice.handle.start().await;
    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Calling);
    assert_eq!(view.error, None);
    assert_eq!(alice.peers.last().local_track_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_media_failure_still_previews_and_answers() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = join(store.clone(), "alice", SyntheticDevices::with_camera_and_mic());
    let blocked = SyntheticDevices::with_camera_and_mic()
        .fail_camera(MediaError::PermissionDenied)
        .fail_microphone(MediaError::PermissionDenied);
    let bob = join(store.clone(), "bob", blocked);

    let view = wait_step(&bob.handle, StepKind::Previewing).await;
    assert_eq!(view.error.as_deref(), Some("Permission blocked. Allow camera/microphone access"));

    wait_step(&alice.handle, StepKind::Previewing).await;
    alice.handle.start().await;
    wait_step(&bob.handle, StepKind::Incoming).await;
    bob.handle.accept().await;

    let view = wait_step(&alice.handle, StepKind::InCall).await;
    assert_eq!(view.error, None);
    assert_eq!(bob.handle.view().step, StepKind::InCall);
    assert_eq!(bob.peers.last().local_track_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_and_close_are_idempotent() {
    let (store, alice, bob) = pair();
    connect(&alice, &bob).await;

    alice.handle.end().await;
    alice.handle.end().await;
    assert_eq!(alice.handle.view().step, StepKind::Previewing);

    alice.handle.close().await;
    alice.handle.close().await;
    let view = alice.handle.view();
    assert!(view.closed);
    assert_eq!(view.step, StepKind::Idle);
    assert_eq!(alice.peers.last().close_calls(), 1);
    assert!(alice.handle.diagnostics().await.is_none());

    // Only Bob's incoming watcher is left.
    wait_step(&bob.handle, StepKind::Previewing).await;
    settle().await;
    assert_eq!(store.watcher_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_mid_call_ends_the_record() {
    let (store, alice, bob) = pair();
    let call_id = connect(&alice, &bob).await;

    bob.handle.close().await;
    assert_eq!(record(&store, call_id).await.status, CallStatus::Ended);

    let view = wait_step(&alice.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_ENDED));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_answer_snapshot_is_ignored() {
    let (store, alice, bob) = pair();
    let call_id = connect(&alice, &bob).await;
    let answer = alice.peers.last().remote_description();

    // An empty update re-publishes the record with its answer.
    store.update_call(&call_id, CallUpdate::default()).await.unwrap();
    settle().await;

    assert_eq!(alice.handle.view().step, StepKind::InCall);
    assert_eq!(alice.peers.peers().len(), 1);
    assert_eq!(alice.peers.last().remote_description(), answer);
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_wait_for_the_answer() {
    let (store, alice, bob) = pair();
    wait_step(&alice.handle, StepKind::Previewing).await;
    wait_step(&bob.handle, StepKind::Previewing).await;

    alice.handle.start().await;
    let call_id = alice.handle.view().call_id.unwrap();
    store
        .append_candidate(&call_id, CandidateSide::Answer, CandidateBlob::new("early"))
        .await
        .unwrap();
    settle().await;
    assert!(alice.peers.last().candidates().is_empty());

    wait_step(&bob.handle, StepKind::Incoming).await;
    bob.handle.accept().await;
    wait_step(&alice.handle, StepKind::InCall).await;
    settle().await;

    let applied = alice.peers.last().candidates();
    assert_eq!(
        applied,
        vec![
            (CandidateBlob::new("early"), true),
            (CandidateBlob::new("cand-bob-0"), true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancel_withdraws_incoming() {
    let (store, alice, bob) = pair();
    wait_step(&alice.handle, StepKind::Previewing).await;
    wait_step(&bob.handle, StepKind::Previewing).await;

    alice.handle.start().await;
    let call_id = alice.handle.view().call_id.unwrap();
    wait_step(&bob.handle, StepKind::Incoming).await;
    alice.handle.end().await;

    let view = wait_step(&bob.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_CANCELLED));
    assert_eq!(record(&store, call_id).await.status, CallStatus::Ended);
    assert!(bob.peers.peers().is_empty());

    // Bob is listening again.
    alice.handle.start().await;
    wait_step(&bob.handle, StepKind::Incoming).await;
}

#[tokio::test(start_paused = true)]
async fn test_accept_without_offer_is_a_protocol_violation() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let bob = join(store.clone(), "bob", SyntheticDevices::with_camera_and_mic());
    wait_step(&bob.handle, StepKind::Previewing).await;

    let bare = store.create_call(&room(), &PartyId::new("alice")).await.unwrap();
    wait_step(&bob.handle, StepKind::Incoming).await;
    bob.handle.accept().await;

    // The call is still ringing, so the watcher may surface it again.
    let view = wait_for(&bob.handle, "an error", |v| v.error.is_some()).await;
    assert_ne!(view.step, StepKind::InCall);
    assert_eq!(view.error.as_deref(), Some("Protocol violation: call has no offer"));
    assert!(bob.peers.peers().is_empty());
    assert_eq!(record(&store, bare.id).await.status, CallStatus::Ringing);
}

#[tokio::test(start_paused = true)]
async fn test_accept_after_cancel_reports_unavailable() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let bob = join(store.clone(), "bob", SyntheticDevices::with_camera_and_mic());
    wait_step(&bob.handle, StepKind::Previewing).await;

    let call = store.create_call(&room(), &PartyId::new("alice")).await.unwrap();
    store
        .update_call(&call.id, CallUpdate::offer(SessionDescription::offer("o")))
        .await
        .unwrap();
    wait_step(&bob.handle, StepKind::Incoming).await;

    // The hang-up is stored but not yet delivered to Bob.
    store.with_database(|db| db.update_call(&call.id, &CallUpdate::status(CallStatus::Ended), Utc::now())).unwrap();
    bob.handle.accept().await;

    let view = bob.handle.view();
    assert_eq!(view.step, StepKind::Previewing);
    assert_eq!(view.error.as_deref(), Some("Protocol violation: call is no longer available"));
    assert_eq!(record(&store, call.id).await.answer, None);
}

#[tokio::test(start_paused = true)]
async fn test_signaling_failure_aborts_attempt() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let flaky = Arc::new(FlakyChannel::new(store.clone()));
    let alice = join(flaky.clone(), "alice", SyntheticDevices::with_camera_and_mic());
    wait_step(&alice.handle, StepKind::Previewing).await;

    flaky.fail_updates(true);
    alice.handle.start().await;

    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Previewing);
    assert_eq!(view.error.as_deref(), Some("Signaling write failed: IO error: store unreachable"));

    let diag = alice.handle.diagnostics().await.unwrap();
    assert_eq!(diag.armed_timers, 0);
    assert_eq!(diag.subscriptions, 0);
    assert!(diag.incoming_watcher);
    assert!(alice.peers.last().is_closed());

    // No automatic retry; the next start succeeds.
    flaky.fail_updates(false);
    settle().await;
    assert_eq!(alice.peers.peers().len(), 1);
    alice.handle.start().await;
    let view = wait_step(&alice.handle, StepKind::Calling).await;
    assert_eq!(view.error, None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_ringing_record_is_not_surfaced() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let abandoned = CallRecord::ringing(room(), PartyId::new("alice"), Utc::now() - chrono::Duration::minutes(10));
    store.with_database(|db| db.insert_call(&abandoned)).unwrap();

    let bob = join(store.clone(), "bob", SyntheticDevices::with_camera_and_mic());
    wait_step(&bob.handle, StepKind::Previewing).await;
    settle().await;
    assert_eq!(bob.handle.view().step, StepKind::Previewing);
}

#[tokio::test(start_paused = true)]
async fn test_glare_earlier_call_wins() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = join(store.clone(), "alice", SyntheticDevices::with_camera_and_mic());
    wait_step(&alice.handle, StepKind::Previewing).await;

    // Bob's call lands in the store without Alice having been told yet.
    let rival = CallRecord::ringing(room(), PartyId::new("bob"), Utc::now() - chrono::Duration::seconds(1));
    store.with_database(|db| db.insert_call(&rival)).unwrap();

    alice.handle.start().await;
    let own = alice.peers.last();
    let view = wait_step(&alice.handle, StepKind::Incoming).await;
    assert_eq!(view.call_id, Some(rival.id));
    assert!(own.is_closed());

    let diag = alice.handle.diagnostics().await.unwrap();
    assert_eq!(diag.armed_timers, 0);

    let mine = store.with_database(|db| db.list_calls(&room(), &[CallStatus::Ended])).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].created_by, PartyId::new("alice"));
}

#[tokio::test(start_paused = true)]
async fn test_glare_later_call_is_ignored() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = join(store.clone(), "alice", SyntheticDevices::with_camera_and_mic());
    wait_step(&alice.handle, StepKind::Previewing).await;

    let rival = CallRecord::ringing(room(), PartyId::new("bob"), Utc::now() + chrono::Duration::seconds(5));
    store.with_database(|db| db.insert_call(&rival)).unwrap();

    alice.handle.start().await;
    let own = alice.handle.view().call_id.unwrap();
    settle().await;

    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Calling);
    assert_eq!(view.call_id, Some(own));
}

#[tokio::test(start_paused = true)]
async fn test_toggles_do_not_renegotiate() {
    let (store, alice, bob) = pair();
    let call_id = connect(&alice, &bob).await;
    let before = record(&store, call_id).await;

    alice.handle.toggle_microphone().await;
    alice.handle.toggle_camera().await;
    let view = alice.handle.view();
    assert!(!view.microphone_on);
    assert!(!view.camera_on);
    assert_eq!(view.step, StepKind::InCall);

    alice.handle.toggle_microphone().await;
    assert!(alice.handle.view().microphone_on);

    settle().await;
    assert_eq!(alice.peers.peers().len(), 1);
    let after = record(&store, call_id).await;
    assert_eq!(after.offer, before.offer);
    assert_eq!(after.answer, before.answer);
    assert_eq!(after.status, CallStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_no_resources_outlive_a_call() {
    let (store, alice, bob) = pair();
    connect(&alice, &bob).await;

    alice.handle.end().await;
    wait_step(&bob.handle, StepKind::Previewing).await;
    settle().await;

    for party in [&alice, &bob] {
        let diag = party.handle.diagnostics().await.unwrap();
        assert_eq!(diag.armed_timers, 0);
        assert_eq!(diag.subscriptions, 0);
        assert!(!diag.has_peer);
        assert!(diag.incoming_watcher);
        assert_eq!(diag.call_id, None);
    }
    assert_eq!(store.watcher_count(), 2);

    alice.handle.close().await;
    bob.handle.close().await;
    settle().await;
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_closes_the_session() {
    let (store, alice, bob) = pair();
    let call_id = connect(&alice, &bob).await;

    drop(alice);
    let view = wait_step(&bob.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_ENDED));
    assert_eq!(record(&store, call_id).await.status, CallStatus::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_next_call_reacquires_media() {
    let (_store, alice, bob) = pair();
    connect(&alice, &bob).await;

    alice.handle.end().await;
    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Previewing);
    assert!(!view.microphone_on);
    assert!(!view.camera_on);
    assert!(view.has_microphone);

    alice.handle.start().await;
    let view = wait_step(&alice.handle, StepKind::Calling).await;
    assert!(view.microphone_on);
    assert!(view.camera_on);
    assert_eq!(alice.peers.peers().len(), 2);
    assert_eq!(alice.peers.last().local_track_count(), 2);
    assert!(!alice.handle.diagnostics().await.unwrap().acquiring_media);
}

/// Alice's first stream is granted, every later request hangs on a prompt.
async fn prompted_alice(store: &Arc<SqliteChannel>) -> Party {
    let alice = join_with(store.clone(), "alice", Arc::new(PromptingDevices::new(1)));
    wait_step(&alice.handle, StepKind::Previewing).await;

    // Place and cancel a call so the granted stream is released.
    alice.handle.start().await;
    assert_eq!(alice.handle.view().step, StepKind::Calling);
    alice.handle.end().await;
    assert_eq!(alice.handle.view().step, StepKind::Previewing);
    alice
}

#[tokio::test(start_paused = true)]
async fn test_pending_start_media_keeps_the_session_responsive() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = prompted_alice(&store).await;

    alice.handle.start().await;
    let view = alice.handle.view();
    assert_eq!(view.step, StepKind::Previewing);
    let diag = alice.handle.diagnostics().await.unwrap();
    assert!(diag.acquiring_media);
    assert!(diag.incoming_watcher);

    // A call from Bob still rings and replaces the waiting start.
    let call = store.create_call(&room(), &PartyId::new("bob")).await.unwrap();
    let view = wait_step(&alice.handle, StepKind::Incoming).await;
    assert_eq!(view.call_id, Some(call.id));
    assert!(!alice.handle.diagnostics().await.unwrap().acquiring_media);
    assert_eq!(alice.peers.peers().len(), 1);

    tokio::time::timeout(Duration::from_secs(60), alice.handle.close())
        .await
        .expect("close completes while media is pending");
    assert!(alice.handle.view().closed);
}

#[tokio::test(start_paused = true)]
async fn test_pending_accept_media_still_sees_the_hang_up() {
    let store = Arc::new(SqliteChannel::open_in_memory().unwrap());
    let alice = prompted_alice(&store).await;
    let bob = join(store.clone(), "bob", SyntheticDevices::with_camera_and_mic());
    wait_step(&bob.handle, StepKind::Previewing).await;

    bob.handle.start().await;
    let call_id = bob.handle.view().call_id.unwrap();
    wait_step(&alice.handle, StepKind::Incoming).await;
    alice.handle.accept().await;

    assert_eq!(alice.handle.view().step, StepKind::Incoming);
    assert!(alice.handle.diagnostics().await.unwrap().acquiring_media);

    // A second accept while waiting is ignored.
    alice.handle.accept().await;
    assert_eq!(alice.peers.peers().len(), 1);

    bob.handle.end().await;
    let view = wait_step(&alice.handle, StepKind::Previewing).await;
    assert_eq!(view.status_message.as_deref(), Some(STATUS_CANCELLED));
    let diag = alice.handle.diagnostics().await.unwrap();
    assert!(!diag.acquiring_media);
    assert!(diag.incoming_watcher);

    let stored = record(&store, call_id).await;
    assert_eq!(stored.status, CallStatus::Ended);
    assert_eq!(stored.answer, None);

    tokio::time::timeout(Duration::from_secs(60), alice.handle.close())
        .await
        .expect("close completes");
}
