//! End-to-end call flows through the facade
//!
//! These drive a real `CallClient` with a recording signaling channel and a
//! scripted negotiator:
//! - outgoing and incoming calls, start to finish
//! - stale and duplicate events
//! - timeouts, busy handling and failure paths
//! - a media stack that never answers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use dispatch_call::signaling::event;
use dispatch_call::{
    CallClient, CallConfig, CallContext, CallError, CallEvent, CallState, EndReason,
    IceCandidate, MediaKind, MediaNegotiator, NegotiatorError, NegotiatorEvent,
    NegotiatorEventKind, Party, SessionDescription, SignalingChannel, SignalingError,
};
use dispatch_common::{SessionId, SignalEnvelope};

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<SignalEnvelope>>,
    broken: AtomicBool,
}

impl RecordingChannel {
    fn events(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.event.clone()).collect()
    }

    fn last(&self) -> SignalEnvelope {
        self.sent.lock().unwrap().last().cloned().expect("nothing sent")
    }
}

impl SignalingChannel for RecordingChannel {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SignalingError::Send("socket down".into()));
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedNegotiator {
    calls: Mutex<Vec<&'static str>>,
    /// When set, offer/answer creation waits for a permit.
    gate: Option<Notify>,
    media_denied: bool,
    reject_answer: bool,
    /// The next `create_offer` never completes.
    stall_next_offer: AtomicBool,
}

impl ScriptedNegotiator {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    async fn describe(&self, call: &'static str) -> Result<SessionDescription, NegotiatorError> {
        self.calls.lock().unwrap().push(call);
        if call == "create_offer" && self.stall_next_offer.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.media_denied {
            return Err(NegotiatorError::MediaUnavailable("microphone permission denied".into()));
        }
        Ok(match call {
            "create_offer" => SessionDescription::offer("v=0 local-offer"),
            _ => SessionDescription::answer("v=0 local-answer"),
        })
    }
}

#[async_trait]
impl MediaNegotiator for ScriptedNegotiator {
    async fn create_offer(
        &self,
        _session_id: &SessionId,
        _kind: MediaKind,
    ) -> Result<SessionDescription, NegotiatorError> {
        self.describe("create_offer").await
    }

    async fn create_answer(
        &self,
        _session_id: &SessionId,
        _kind: MediaKind,
        _remote_offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription, NegotiatorError> {
        self.describe("create_answer").await
    }

    async fn apply_answer(
        &self,
        _session_id: &SessionId,
        _answer: &SessionDescription,
    ) -> Result<(), NegotiatorError> {
        self.calls.lock().unwrap().push("apply_answer");
        if self.reject_answer {
            return Err(NegotiatorError::Negotiation("answer does not match offer".into()));
        }
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _session_id: &SessionId,
        _candidate: &IceCandidate,
    ) -> Result<(), NegotiatorError> {
        self.calls.lock().unwrap().push("add_remote_candidate");
        Ok(())
    }

    async fn set_track_enabled(
        &self,
        _session_id: &SessionId,
        _kind: MediaKind,
        _enabled: bool,
    ) -> Result<(), NegotiatorError> {
        self.calls.lock().unwrap().push("set_track_enabled");
        Ok(())
    }

    async fn close(&self, _session_id: &SessionId) -> Result<(), NegotiatorError> {
        self.calls.lock().unwrap().push("close");
        Ok(())
    }
}

struct Harness {
    client: CallClient,
    channel: Arc<RecordingChannel>,
    negotiator: Arc<ScriptedNegotiator>,
    events: broadcast::Receiver<CallEvent>,
}

fn harness_with(negotiator: ScriptedNegotiator) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dispatch_call=debug")
        .with_test_writer()
        .try_init();

    let channel = Arc::new(RecordingChannel::default());
    let negotiator = Arc::new(negotiator);
    let client = CallClient::new(
        CallConfig::default(),
        CallContext::new("customer-1").with_room("request-42"),
        channel.clone(),
        negotiator.clone(),
    );
    let events = client.subscribe_events();
    Harness {
        client,
        channel,
        negotiator,
        events,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedNegotiator::default())
}

fn envelope(name: &str, data: Value) -> SignalEnvelope {
    SignalEnvelope::new(name, data)
}

fn incoming(session_id: Value, kind: &str) -> SignalEnvelope {
    envelope(
        event::INCOMING,
        json!({
            "sessionId": session_id,
            "callerId": "driver-9",
            "callerDisplayName": "Alex",
            "mediaKind": kind,
            "offer": { "type": "offer", "sdp": "v=0 remote-offer" },
        }),
    )
}

fn accepted(session_id: &SessionId) -> SignalEnvelope {
    envelope(
        event::ACCEPTED,
        json!({
            "sessionId": session_id,
            "answererId": "driver-9",
            "answer": { "type": "answer", "sdp": "v=0 remote-answer" },
        }),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn next_ended(events: &mut broadcast::Receiver<CallEvent>) -> (EndReason, Option<Duration>) {
    loop {
        match events.recv().await.expect("event stream closed") {
            CallEvent::Ended {
                reason, duration, ..
            } => return (reason, duration),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn outgoing_call_sends_one_initiate_and_one_end() {
    let mut h = harness();

    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();
    assert_eq!(h.client.snapshot().state, CallState::Dialing);

    let initiate = h.channel.last();
    assert_eq!(initiate.event, "call:initiate");
    assert_eq!(initiate.data["sessionId"], json!(sid.as_str()));
    assert_eq!(initiate.data["callerId"], "customer-1");
    assert_eq!(initiate.data["peerId"], "driver-9");
    assert_eq!(initiate.data["roomId"], "request-42");
    assert_eq!(initiate.data["offer"]["type"], "offer");

    assert!(h.client.handle_signal(&accepted(&sid)).await.unwrap());
    let snapshot = h.client.snapshot();
    assert_eq!(snapshot.state, CallState::Active);
    assert!(snapshot.started_at.is_some());

    h.client.end_call().await.unwrap();
    assert!(matches!(h.client.end_call().await, Err(CallError::NoActiveCall)));

    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(h.channel.events(), vec!["call:initiate", "call:end"]);
    assert_eq!(h.channel.last().data["reason"], "hangup");

    let (reason, duration) = next_ended(&mut h.events).await;
    assert_eq!(reason, EndReason::Hangup { by: Party::Local });
    assert!(duration.is_some());

    let negotiator = h.negotiator.clone();
    wait_until(|| negotiator.calls().contains(&"close")).await;
    assert_eq!(negotiator.calls(), vec!["create_offer", "apply_answer", "close"]);
}

#[tokio::test]
async fn second_start_call_is_refused() {
    let h = harness();
    h.client.start_call("driver-9", MediaKind::Video).await.unwrap();

    let second = h.client.start_call("driver-2", MediaKind::Audio).await;

    assert!(matches!(second, Err(CallError::AlreadyInCall)));
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
    assert_eq!(h.client.snapshot().peer_id.unwrap().as_str(), "driver-9");
}

#[tokio::test]
async fn events_for_other_sessions_change_nothing() {
    let h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();
    let before = h.client.snapshot();

    let stale = [
        accepted(&SessionId::from("another")),
        envelope(event::ENDED, json!({ "sessionId": "another" })),
        envelope(event::CANCELLED, json!({})),
    ];
    for signal in &stale {
        assert!(!h.client.handle_signal(signal).await.unwrap());
    }

    assert_eq!(h.client.snapshot(), before);
    assert_eq!(h.client.snapshot().session_id, Some(sid));
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
}

#[tokio::test]
async fn incoming_then_cancelled_never_touches_media() {
    let mut h = harness();

    assert!(h.client.handle_signal(&incoming(json!(7), "video")).await.unwrap());
    let snapshot = h.client.snapshot();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert_eq!(snapshot.peer_display_name.as_deref(), Some("Alex"));

    match h.events.recv().await.unwrap() {
        CallEvent::Incoming {
            session_id,
            media_kind,
            ..
        } => {
            assert_eq!(session_id, SessionId::from(7u64));
            assert_eq!(media_kind, MediaKind::Video);
        }
        other => panic!("expected incoming, got {other:?}"),
    }

    let cancel = envelope(event::CANCELLED, json!({ "sessionId": 7 }));
    assert!(h.client.handle_signal(&cancel).await.unwrap());

    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(next_ended(&mut h.events).await.0, EndReason::Cancelled);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.channel.events().is_empty());
    assert!(h.negotiator.calls().is_empty());

    // Redelivery of the same invitation is stale.
    assert!(!h.client.handle_signal(&incoming(json!("7"), "video")).await.unwrap());
    assert_eq!(h.client.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn accepting_then_rejecting_yields_only_the_accept() {
    let h = harness();
    h.client.handle_signal(&incoming(json!(11), "audio")).await.unwrap();

    h.client.accept_call().await.unwrap();
    let rejected = h.client.reject_call().await;

    assert!(matches!(rejected, Err(CallError::InvalidState { .. })));
    assert_eq!(h.channel.events(), vec!["call:accept"]);
    assert_eq!(h.channel.last().data["answer"]["type"], "answer");
    assert_eq!(h.client.snapshot().state, CallState::Active);
}

#[tokio::test]
async fn rejecting_a_ringing_call() {
    let mut h = harness();
    h.client.handle_signal(&incoming(json!(12), "audio")).await.unwrap();

    h.client.reject_call().await.unwrap();

    assert_eq!(h.channel.events(), vec!["call:reject"]);
    assert_eq!(h.channel.last().data["reason"], "rejected");
    assert_eq!(next_ended(&mut h.events).await.0, EndReason::Rejected);
    assert!(h.negotiator.calls().is_empty());
}

#[tokio::test]
async fn video_toggle_on_audio_call_is_refused() {
    let h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();
    h.client.handle_signal(&accepted(&sid)).await.unwrap();
    let before = h.client.snapshot();

    assert!(!h.client.toggle_video().await);
    assert_eq!(h.client.snapshot(), before);

    assert!(h.client.toggle_audio().await);
    assert!(!h.client.snapshot().local_media.audio);
    assert_eq!(h.channel.last().event, "call:toggle-media");
    assert_eq!(h.channel.last().data["enabled"], false);
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_call_times_out() {
    let mut h = harness();
    h.client.handle_signal(&incoming(json!(21), "audio")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(h.channel.events(), vec!["call:reject"]);
    assert_eq!(h.channel.last().data["reason"], "timeout");
    assert_eq!(next_ended(&mut h.events).await.0, EndReason::Timeout);
}

#[tokio::test(start_paused = true)]
async fn answered_call_is_not_timed_out() {
    let h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();
    h.client.handle_signal(&accepted(&sid)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.client.snapshot().state, CallState::Active);
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
}

#[tokio::test]
async fn hangup_while_offer_pending_sends_nothing() {
    let h = harness_with(ScriptedNegotiator {
        gate: Some(Notify::new()),
        ..ScriptedNegotiator::default()
    });

    let caller = h.client.clone();
    let placing =
        tokio::spawn(async move { caller.start_call("driver-9", MediaKind::Video).await });

    let negotiator = h.negotiator.clone();
    wait_until(|| negotiator.calls().contains(&"create_offer")).await;
    assert_eq!(h.client.snapshot().state, CallState::Dialing);

    h.client.end_call().await.unwrap();
    assert_eq!(h.client.snapshot().state, CallState::Idle);

    if let Some(gate) = &h.negotiator.gate {
        gate.notify_one();
    }
    let result = placing.await.unwrap();

    assert!(matches!(result, Err(CallError::Superseded)));
    assert!(h.channel.events().is_empty());
    wait_until(|| negotiator.calls().contains(&"close")).await;
}

#[tokio::test]
async fn denied_media_fails_without_signaling() {
    let mut h = harness_with(ScriptedNegotiator {
        media_denied: true,
        ..ScriptedNegotiator::default()
    });

    let result = h.client.start_call("driver-9", MediaKind::Video).await;

    assert!(matches!(result, Err(CallError::LocalMediaUnavailable(_))));
    assert!(h.channel.events().is_empty());
    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(next_ended(&mut h.events).await.0, EndReason::LocalMediaUnavailable);
}

#[tokio::test]
async fn second_caller_gets_busy_rejection() {
    let h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();

    assert!(!h.client.handle_signal(&incoming(json!(99), "audio")).await.unwrap());

    let reject = h.channel.last();
    assert_eq!(reject.event, "call:reject");
    assert_eq!(reject.data["sessionId"], "99");
    assert_eq!(reject.data["reason"], "busy");
    assert_eq!(h.client.snapshot().session_id, Some(sid));
}

#[tokio::test]
async fn peer_offline_ack_ends_call() {
    let mut h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();

    let ack = envelope(
        event::INITIATED,
        json!({ "sessionId": sid, "targetPeerId": "driver-9", "peerOnline": false }),
    );
    h.client.handle_signal(&ack).await.unwrap();

    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(next_ended(&mut h.events).await.0, EndReason::PeerOffline);
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
}

#[tokio::test]
async fn unreachable_signaling_abandons_the_call() {
    let mut h = harness();
    h.channel.broken.store(true, Ordering::SeqCst);

    let result = h.client.start_call("driver-9", MediaKind::Audio).await;

    assert!(matches!(result, Err(CallError::Signaling(_))));
    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert!(matches!(next_ended(&mut h.events).await.0, EndReason::Other(_)));
}

#[tokio::test]
async fn bad_answer_ends_call_with_negotiation_failure() {
    let mut h = harness_with(ScriptedNegotiator {
        reject_answer: true,
        ..ScriptedNegotiator::default()
    });
    let sid = h.client.start_call("driver-9", MediaKind::Audio).await.unwrap();

    h.client.handle_signal(&accepted(&sid)).await.unwrap();

    assert_eq!(next_ended(&mut h.events).await.0, EndReason::NegotiationFailed);
    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert_eq!(h.channel.events(), vec!["call:initiate", "call:end"]);
    assert_eq!(h.channel.last().data["reason"], "negotiation_failed");
}

#[tokio::test]
async fn local_candidates_trickle_once_connected() {
    let h = harness();
    h.client.handle_signal(&incoming(json!(31), "audio")).await.unwrap();
    let sid = SessionId::from(31u64);

    let candidate = |c: &str| NegotiatorEvent {
        session_id: sid.clone(),
        kind: NegotiatorEventKind::LocalCandidate(IceCandidate::new(c)),
    };

    // Before answering nothing may reach the caller.
    assert!(h.client.handle_negotiator_event(candidate("early")).await);
    assert!(h.channel.events().is_empty());

    h.client.accept_call().await.unwrap();
    assert_eq!(h.channel.events(), vec!["call:accept", "call:ice-candidate"]);

    h.client.handle_negotiator_event(candidate("late")).await;
    let last = h.channel.last();
    assert_eq!(last.event, "call:ice-candidate");
    assert_eq!(last.data["candidate"]["candidate"], "late");
    assert_eq!(last.data["targetPeerId"], "driver-9");

    // Callbacks for a session that is gone are dropped.
    let stale = NegotiatorEvent {
        session_id: SessionId::from("old"),
        kind: NegotiatorEventKind::RemoteStream(MediaKind::Audio),
    };
    assert!(!h.client.handle_negotiator_event(stale).await);
}

#[tokio::test]
async fn remote_hangup_ends_without_reply() {
    let mut h = harness();
    let sid = h.client.start_call("driver-9", MediaKind::Video).await.unwrap();
    h.client.handle_signal(&accepted(&sid)).await.unwrap();

    let ended = envelope(
        event::ENDED,
        json!({ "sessionId": sid, "endedBy": "driver-9", "durationSeconds": 12 }),
    );
    h.client.handle_signal(&ended).await.unwrap();

    assert_eq!(
        next_ended(&mut h.events).await.0,
        EndReason::Hangup { by: Party::Remote }
    );
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
    // A repeat of the same end is stale.
    assert!(!h.client.handle_signal(&ended).await.unwrap());
}

#[tokio::test]
async fn ending_a_call_releases_a_stuck_offer() {
    let h = harness_with(ScriptedNegotiator {
        stall_next_offer: AtomicBool::new(true),
        ..ScriptedNegotiator::default()
    });

    let caller = h.client.clone();
    let placing =
        tokio::spawn(async move { caller.start_call("driver-9", MediaKind::Audio).await });
    let negotiator = h.negotiator.clone();
    wait_until(|| negotiator.calls().contains(&"create_offer")).await;

    h.client.end_call().await.unwrap();

    assert!(matches!(placing.await.unwrap(), Err(CallError::Superseded)));
    wait_until(|| negotiator.calls().contains(&"close")).await;

    // The media stack is usable again straight away.
    let sid = h.client.start_call("driver-2", MediaKind::Audio).await.unwrap();
    assert_eq!(h.client.snapshot().session_id, Some(sid));
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
    assert_eq!(negotiator.calls(), vec!["create_offer", "close", "create_offer"]);
}

#[tokio::test(start_paused = true)]
async fn offer_that_never_arrives_times_out_and_frees_the_worker() {
    let mut h = harness_with(ScriptedNegotiator {
        stall_next_offer: AtomicBool::new(true),
        ..ScriptedNegotiator::default()
    });

    let first = h.client.start_call("driver-9", MediaKind::Audio).await;

    // The ring timer shares the deadline, so either may end the call.
    assert!(matches!(
        first,
        Err(CallError::NegotiationFailed(_) | CallError::Superseded)
    ));
    assert_eq!(h.client.snapshot().state, CallState::Idle);
    assert!(matches!(
        next_ended(&mut h.events).await.0,
        EndReason::NegotiationFailed | EndReason::Timeout
    ));
    let negotiator = h.negotiator.clone();
    wait_until(|| negotiator.calls().contains(&"close")).await;

    let second = h.client.start_call("driver-2", MediaKind::Audio).await;

    assert!(second.is_ok());
    assert_eq!(h.channel.events(), vec!["call:initiate"]);
    assert_eq!(negotiator.calls(), vec!["create_offer", "close", "create_offer"]);
}
