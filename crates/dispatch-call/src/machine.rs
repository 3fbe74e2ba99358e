//! The call session state machine.
//!
//! ```text
//!            startCall                 accepted
//!   Idle ───────────────▶ Dialing ───────────────▶ Active ──endCall/ended──▶ Ending ──▶ Idle
//!     │                      │                       ▲
//!     │ incomingCall         │ rejected/failed/      │ acceptCall
//!     ▼                      │ cancelled/timeout     │
//!   Ringing ─────────────────┼───────────────────────┘
//!     │ rejectCall/cancelled ▼
//!     └──────────────────▶ (Failed) ──▶ Idle
//! ```
//!
//! [`CallStateMachine`] is a plain value. Every operation validates the
//! transition, mutates the single session slot, and appends the resulting
//! [`Effect`]s for the caller to carry out. It never blocks and never awaits;
//! asynchronous negotiator work re-enters through [`description_ready`],
//! [`negotiation_failed`] and friends with the session id it was started for.
//!
//! Correlation rule: an event whose `sessionId` is missing or differs from the
//! current session is dropped without effect. Ids of finished sessions are
//! retired so late duplicates of their events are dropped too.
//!
//! [`description_ready`]: CallStateMachine::description_ready
//! [`negotiation_failed`]: CallStateMachine::negotiation_failed

use crate::dedup::RetiredSessions;
use crate::error::{CallError, EndReason, Party};
use crate::events::CallEvent;
use crate::negotiator::{IceCandidate, NegotiatorCommand, NegotiatorError, SessionDescription};
use crate::session::{CallRole, CallSession, CallSnapshot, CallState, MediaKind};
use crate::signaling::{
    self, Accepted, FailureReason, InboundSignal, Incoming, MediaToggled, OutboundSignal,
};
use chrono::{DateTime, Utc};
use dispatch_common::config::CallSettings;
use dispatch_common::{PeerId, SessionId};
use std::time::Duration;

/// Tunables for the call layer.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Dialing/Ringing sessions fail with `Timeout` after this long.
    pub ring_timeout: Duration,
    pub retired_session_capacity: usize,
    pub event_capacity: usize,
    pub auto_reject_when_busy: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            retired_session_capacity: 64,
            event_capacity: 256,
            auto_reject_when_busy: true,
        }
    }
}

impl From<&CallSettings> for CallConfig {
    fn from(settings: &CallSettings) -> Self {
        Self {
            ring_timeout: settings.ring_timeout(),
            retired_session_capacity: settings.retired_session_capacity,
            event_capacity: settings.event_capacity,
            auto_reject_when_busy: settings.auto_reject_when_busy,
        }
    }
}

/// Who we are, passed in explicitly when the call layer is built.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub local_user_id: PeerId,
    /// Service request / room the calls belong to.
    pub room_id: Option<String>,
}

impl CallContext {
    pub fn new(local_user_id: impl Into<PeerId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            room_id: None,
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}

/// A side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Emit a signaling message.
    Send(OutboundSignal),
    /// Hand work to the negotiator.
    Negotiate(NegotiatorCommand),
    /// Push a notification to the UI.
    Notify(CallEvent),
    /// Replace the UI projection.
    Publish(CallSnapshot),
    /// Call [`CallStateMachine::ring_timeout`] for this session after a delay.
    ArmTimer {
        session_id: SessionId,
        after: Duration,
    },
}

pub struct CallStateMachine {
    config: CallConfig,
    context: CallContext,
    session: Option<CallSession>,
    retired: RetiredSessions,
}

impl CallStateMachine {
    pub fn new(config: CallConfig, context: CallContext) -> Self {
        let retired = RetiredSessions::new(config.retired_session_capacity);
        Self {
            config,
            context,
            session: None,
            retired,
        }
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut CallSession> {
        self.session.as_mut()
    }

    pub fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.session
            .as_ref()
            .map_or_else(CallSnapshot::idle, CallSession::snapshot)
    }

    pub fn is_current(&self, session_id: &SessionId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.session_id == *session_id)
    }

    pub fn is_retired(&self, session_id: &SessionId) -> bool {
        self.retired.contains(session_id)
    }

    fn current_mut(&mut self, session_id: &SessionId) -> Option<&mut CallSession> {
        self.session
            .as_mut()
            .filter(|s| s.session_id == *session_id)
    }

    // === Local actions ===

    /// Place an outgoing call. The offer is requested from the negotiator;
    /// `call:initiate` goes out once [`description_ready`](Self::description_ready)
    /// delivers it.
    pub fn start_call(
        &mut self,
        peer_id: PeerId,
        peer_display_name: Option<String>,
        kind: MediaKind,
        fx: &mut Vec<Effect>,
    ) -> Result<SessionId, CallError> {
        if let Some(current) = &self.session {
            tracing::debug!(
                session = %current.session_id,
                state = %current.state,
                "Refusing to start a second call"
            );
            return Err(CallError::AlreadyInCall);
        }

        let session_id = SessionId::generate();
        let mut session = CallSession::new(
            session_id.clone(),
            CallRole::Caller,
            kind,
            peer_id,
            peer_display_name,
        );
        session.negotiator_engaged = true;

        tracing::info!(
            session = %session_id,
            peer = %session.peer_id,
            kind = kind.as_str(),
            "Placing call"
        );

        fx.push(Effect::Publish(session.snapshot()));
        fx.push(Effect::ArmTimer {
            session_id: session_id.clone(),
            after: self.config.ring_timeout,
        });
        fx.push(Effect::Negotiate(NegotiatorCommand::CreateOffer {
            session_id: session_id.clone(),
            kind,
        }));
        self.session = Some(session);
        Ok(session_id)
    }

    /// Answer the ringing call. The session is `Active` immediately;
    /// `call:accept` goes out once the negotiator produced the answer.
    pub fn accept_call(
        &mut self,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> Result<SessionId, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState {
                action: "accept",
                state: session.state,
            });
        }

        if session.started_at.is_none() {
            session.started_at = Some(now);
        }
        session.negotiator_engaged = true;
        advance(session, CallState::Active, fx);

        fx.push(Effect::Negotiate(NegotiatorCommand::CreateAnswer {
            session_id: session.session_id.clone(),
            kind: session.media_kind,
            remote_offer: session.remote_offer.clone(),
        }));
        flush_remote_candidates(session, fx);
        Ok(session.session_id.clone())
    }

    pub fn reject_call(
        &mut self,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> Result<SessionId, CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState {
                action: "reject",
                state: session.state,
            });
        }

        let session_id = session.session_id.clone();
        fx.push(reject(&session_id, EndReason::Rejected.wire_name()));
        self.finish(EndReason::Rejected, None, now, fx);
        Ok(session_id)
    }

    /// Hang up. Also cancels an outgoing call that is still dialing, and
    /// declines a ringing one.
    pub fn end_call(
        &mut self,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> Result<SessionId, CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        let session_id = session.session_id.clone();
        let state = session.state;

        match state {
            CallState::Ringing => self.reject_call(now, fx),
            CallState::Dialing => {
                if session.announced {
                    fx.push(end(session, EndReason::Cancelled.wire_name()));
                }
                self.finish(EndReason::Cancelled, Some(CallState::Ending), now, fx);
                Ok(session_id)
            }
            CallState::Active => {
                let reason = EndReason::Hangup { by: Party::Local };
                if session.announced {
                    fx.push(end(session, reason.wire_name()));
                } else {
                    // Answer still being produced: the caller never saw an accept.
                    fx.push(reject(&session_id, reason.wire_name()));
                }
                self.finish(reason, Some(CallState::Ending), now, fx);
                Ok(session_id)
            }
            state => Err(CallError::InvalidState {
                action: "end",
                state,
            }),
        }
    }

    // === Negotiator completions ===

    /// Result of the offer (caller) or answer (callee) request.
    ///
    /// Returns `Superseded` without effects when the session it was requested
    /// for is no longer current.
    pub fn description_ready(
        &mut self,
        session_id: &SessionId,
        result: Result<SessionDescription, NegotiatorError>,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> Result<(), CallError> {
        let local_user_id = self.context.local_user_id.clone();
        let room_id = self.context.room_id.clone();

        let Some(session) = self.current_mut(session_id) else {
            tracing::debug!(session = %session_id, "Discarding description for a finished call");
            return Err(CallError::Superseded);
        };
        let expected = match session.role {
            CallRole::Caller => CallState::Dialing,
            CallRole::Callee => CallState::Active,
        };
        if session.state != expected || session.announced {
            tracing::debug!(
                session = %session_id,
                state = %session.state,
                "Discarding description, call moved on"
            );
            return Err(CallError::Superseded);
        }

        let description = match result {
            Ok(description) => description,
            Err(err) => {
                tracing::warn!(session = %session_id, error = %err, "Local description failed");
                let reason = match err {
                    NegotiatorError::MediaUnavailable(_) => EndReason::LocalMediaUnavailable,
                    _ => EndReason::NegotiationFailed,
                };
                // A caller has not announced anything yet; a callee's caller is waiting.
                if session.role == CallRole::Callee {
                    fx.push(reject(session_id, reason.wire_name()));
                }
                self.finish(reason, Some(CallState::Failed), now, fx);
                return Err(err.into());
            }
        };

        session.media_acquired = true;
        session.announced = true;
        match session.role {
            CallRole::Caller => {
                session.local_offer = Some(description.clone());
                fx.push(Effect::Send(OutboundSignal::Initiate(signaling::Initiate {
                    session_id: session_id.clone(),
                    caller_id: local_user_id,
                    peer_id: session.peer_id.clone(),
                    media_kind: session.media_kind,
                    offer: description,
                    room_id,
                })));
            }
            CallRole::Callee => {
                fx.push(Effect::Send(OutboundSignal::Accept(signaling::Accept {
                    session_id: session_id.clone(),
                    answer: description,
                })));
            }
        }
        tracing::info!(session = %session_id, role = ?session.role, "Call announced to peer");

        flush_local_candidates(session, fx);
        Ok(())
    }

    /// The announcement could not be delivered; drop the session without
    /// further signaling.
    pub fn abandon(
        &mut self,
        session_id: &SessionId,
        reason: EndReason,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        self.finish(reason, Some(CallState::Failed), now, fx);
        true
    }

    /// Offer/answer application or connectivity failed.
    pub fn negotiation_failed(
        &mut self,
        session_id: &SessionId,
        detail: &str,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.current_mut(session_id) else {
            tracing::debug!(
                session = %session_id,
                "Ignoring negotiation failure for a finished call"
            );
            return false;
        };

        tracing::warn!(session = %session_id, detail, "Negotiation failed");
        let reason = EndReason::NegotiationFailed;
        if session.announced {
            fx.push(end(session, reason.wire_name()));
        } else if session.role == CallRole::Callee && session.state == CallState::Active {
            fx.push(reject(session_id, reason.wire_name()));
        }
        self.finish(reason, Some(CallState::Failed), now, fx);
        true
    }

    /// Ring timer fired.
    pub fn ring_timeout(
        &mut self,
        session_id: &SessionId,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.current_mut(session_id) else {
            return false;
        };
        if !session.state.is_pending() {
            return false;
        }

        tracing::info!(session = %session_id, state = %session.state, "Call timed out");
        let reason = EndReason::Timeout;
        match session.role {
            CallRole::Caller if session.announced => fx.push(end(session, reason.wire_name())),
            CallRole::Caller => {}
            CallRole::Callee => fx.push(reject(session_id, reason.wire_name())),
        }
        self.finish(reason, Some(CallState::Failed), now, fx);
        true
    }

    /// A local connectivity candidate to trickle to the peer.
    pub fn local_candidate(
        &mut self,
        session_id: &SessionId,
        candidate: IceCandidate,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.current_mut(session_id) else {
            return false;
        };
        session.pending_local_candidates.push(candidate);
        flush_local_candidates(session, fx);
        true
    }

    pub fn local_stream(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        fx: &mut Vec<Effect>,
    ) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        fx.push(Effect::Notify(CallEvent::LocalStream {
            session_id: session_id.clone(),
            media_kind: kind,
        }));
        true
    }

    pub fn remote_stream(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        fx: &mut Vec<Effect>,
    ) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        fx.push(Effect::Notify(CallEvent::RemoteStream {
            session_id: session_id.clone(),
            media_kind: kind,
        }));
        true
    }

    // === Signaling ===

    /// Apply an inbound signaling event. Returns whether it had any effect.
    pub fn handle_signal(
        &mut self,
        signal: InboundSignal,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let signal = match signal {
            InboundSignal::Incoming(incoming) => return self.on_incoming(incoming, fx),
            other => other,
        };

        let event = signal.event_name();
        let Some(session_id) = signal.session_id().cloned() else {
            tracing::debug!(event, "Dropping event without session id");
            return false;
        };
        let Some(state) = self.current_mut(&session_id).map(|s| s.state) else {
            tracing::debug!(
                event,
                session = %session_id,
                retired = self.is_retired(&session_id),
                "Dropping event for another session"
            );
            return false;
        };

        match signal {
            InboundSignal::Initiated(ack) if state == CallState::Dialing => {
                if ack.peer_online {
                    tracing::debug!(session = %session_id, "Server acknowledged call");
                } else {
                    self.finish(EndReason::PeerOffline, Some(CallState::Failed), now, fx);
                }
                true
            }
            InboundSignal::Accepted(accepted) if state == CallState::Dialing => {
                self.on_accepted(&session_id, accepted, now, fx)
            }
            InboundSignal::Rejected(rejected) if state == CallState::Dialing => {
                let reason = match rejected.reason.as_deref() {
                    Some("busy") | Some("peer_busy") => EndReason::PeerBusy,
                    _ => EndReason::Rejected,
                };
                self.finish(reason, Some(CallState::Failed), now, fx);
                true
            }
            InboundSignal::Failed(failed) => {
                let reason = match failed.reason {
                    FailureReason::PeerOffline => EndReason::PeerOffline,
                    FailureReason::PeerBusy => EndReason::PeerBusy,
                    FailureReason::Timeout => EndReason::Timeout,
                    FailureReason::Other => EndReason::Other("server reported failure".into()),
                };
                self.finish(reason, Some(CallState::Failed), now, fx);
                true
            }
            InboundSignal::Cancelled(_) => {
                let via = match state {
                    CallState::Ringing => None,
                    CallState::Dialing => Some(CallState::Failed),
                    _ => Some(CallState::Ending),
                };
                self.finish(EndReason::Cancelled, via, now, fx);
                true
            }
            InboundSignal::Ended(ended) => {
                if let Some(secs) = ended.duration_seconds {
                    tracing::debug!(
                        session = %session_id,
                        server_duration_secs = secs,
                        "Peer ended call"
                    );
                }
                self.finish(
                    EndReason::Hangup { by: Party::Remote },
                    Some(CallState::Ending),
                    now,
                    fx,
                );
                true
            }
            InboundSignal::IceCandidate(remote) => {
                let Some(session) = self.current_mut(&session_id) else {
                    return false;
                };
                match state {
                    CallState::Active => {
                        fx.push(Effect::Negotiate(NegotiatorCommand::AddRemoteCandidate {
                            session_id,
                            candidate: remote.candidate,
                        }));
                    }
                    // Arrived ahead of the accept; applied on entering Active.
                    _ => session.pending_remote_candidates.push(remote.candidate),
                }
                true
            }
            InboundSignal::MediaToggled(toggled) if state == CallState::Active => {
                self.on_media_toggled(&session_id, toggled, fx)
            }
            other => {
                tracing::debug!(
                    event = other.event_name(),
                    session = %session_id,
                    state = %state,
                    "Event not valid in current state"
                );
                false
            }
        }
    }

    fn on_incoming(&mut self, incoming: Incoming, fx: &mut Vec<Effect>) -> bool {
        let Some(session_id) = incoming.session_id else {
            tracing::debug!(
                caller = %incoming.caller_id,
                "Dropping incoming call without session id"
            );
            return false;
        };
        if self.is_retired(&session_id) {
            tracing::debug!(session = %session_id, "Dropping stale incoming call");
            return false;
        }
        if let Some(current) = &self.session {
            if current.session_id == session_id {
                tracing::debug!(session = %session_id, "Dropping duplicate incoming call");
                return false;
            }
            if self.config.auto_reject_when_busy {
                tracing::info!(
                    session = %session_id,
                    caller = %incoming.caller_id,
                    current = %current.session_id,
                    "Rejecting incoming call while busy"
                );
                fx.push(reject(&session_id, EndReason::PeerBusy.wire_name()));
            }
            self.retired.retire(session_id);
            return false;
        }

        let mut session = CallSession::new(
            session_id.clone(),
            CallRole::Callee,
            incoming.media_kind,
            incoming.caller_id,
            incoming.caller_display_name,
        );
        session.remote_offer = incoming.offer;

        tracing::info!(
            session = %session_id,
            caller = %session.peer_id,
            kind = session.media_kind.as_str(),
            "Incoming call"
        );

        fx.push(Effect::Publish(session.snapshot()));
        fx.push(Effect::ArmTimer {
            session_id: session_id.clone(),
            after: self.config.ring_timeout,
        });
        fx.push(Effect::Notify(CallEvent::Incoming {
            session_id,
            peer_id: session.peer_id.clone(),
            peer_display_name: session.peer_display_name.clone(),
            media_kind: session.media_kind,
        }));
        self.session = Some(session);
        true
    }

    fn on_accepted(
        &mut self,
        session_id: &SessionId,
        accepted: Accepted,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.current_mut(session_id) else {
            return false;
        };
        if !session.announced {
            tracing::debug!(session = %session_id, "Accept arrived before our initiate went out");
            return false;
        }

        let Some(answer) = accepted.answer else {
            tracing::warn!(session = %session_id, "Peer accepted without an answer");
            fx.push(end(session, EndReason::NegotiationFailed.wire_name()));
            self.finish(EndReason::NegotiationFailed, Some(CallState::Failed), now, fx);
            return true;
        };

        tracing::info!(
            session = %session_id,
            setup_ms = ?session_id.created_at().map(|t| (now - t).num_milliseconds()),
            "Peer answered"
        );
        if session.started_at.is_none() {
            session.started_at = Some(now);
        }
        session.remote_answer = Some(answer.clone());
        advance(session, CallState::Active, fx);

        fx.push(Effect::Negotiate(NegotiatorCommand::ApplyAnswer {
            session_id: session_id.clone(),
            answer,
        }));
        flush_remote_candidates(session, fx);
        flush_local_candidates(session, fx);
        true
    }

    fn on_media_toggled(
        &mut self,
        session_id: &SessionId,
        toggled: MediaToggled,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(session) = self.current_mut(session_id) else {
            return false;
        };
        session.remote_media.set(toggled.media_kind, toggled.enabled);
        tracing::debug!(
            session = %session_id,
            kind = toggled.media_kind.as_str(),
            enabled = toggled.enabled,
            "Peer toggled media"
        );
        fx.push(Effect::Publish(session.snapshot()));
        fx.push(Effect::Notify(CallEvent::RemoteMediaToggled {
            session_id: session_id.clone(),
            media_kind: toggled.media_kind,
            enabled: toggled.enabled,
        }));
        true
    }

    /// Tear down the current session and return to `Idle`.
    ///
    /// `via` is the transient state published first (`Ending` or `Failed`).
    /// The negotiator is told to release resources before the `Idle`
    /// projection goes out, and the id is retired.
    fn finish(
        &mut self,
        reason: EndReason,
        via: Option<CallState>,
        now: DateTime<Utc>,
        fx: &mut Vec<Effect>,
    ) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let from = session.state;
        let duration = session.duration(now);

        if let Some(transient) = via {
            session.state = transient;
            fx.push(Effect::Publish(session.snapshot()));
        }
        if session.negotiator_engaged {
            fx.push(Effect::Negotiate(NegotiatorCommand::Close {
                session_id: session.session_id.clone(),
            }));
        }

        tracing::info!(
            session = %session.session_id,
            from = %from,
            reason = reason.wire_name(),
            duration = ?duration,
            "Call ended"
        );

        fx.push(Effect::Notify(CallEvent::Ended {
            session_id: session.session_id.clone(),
            reason,
            duration,
        }));
        self.retired.retire(session.session_id);
        fx.push(Effect::Publish(CallSnapshot::idle()));
    }
}

fn advance(session: &mut CallSession, to: CallState, fx: &mut Vec<Effect>) {
    tracing::info!(
        session = %session.session_id,
        from = %session.state,
        to = %to,
        "Call state changed"
    );
    session.state = to;
    fx.push(Effect::Publish(session.snapshot()));
}

/// Local candidates only go out once the peer knows about the session.
fn flush_local_candidates(session: &mut CallSession, fx: &mut Vec<Effect>) {
    if session.state != CallState::Active || !session.announced {
        return;
    }
    for candidate in session.pending_local_candidates.drain(..) {
        fx.push(Effect::Send(OutboundSignal::IceCandidate(
            signaling::LocalCandidate {
                session_id: session.session_id.clone(),
                target_peer_id: session.peer_id.clone(),
                candidate,
            },
        )));
    }
}

fn flush_remote_candidates(session: &mut CallSession, fx: &mut Vec<Effect>) {
    for candidate in session.pending_remote_candidates.drain(..) {
        fx.push(Effect::Negotiate(NegotiatorCommand::AddRemoteCandidate {
            session_id: session.session_id.clone(),
            candidate,
        }));
    }
}

fn end(session: &CallSession, reason: &str) -> Effect {
    Effect::Send(OutboundSignal::End(signaling::End {
        session_id: session.session_id.clone(),
        target_peer_id: session.peer_id.clone(),
        reason: reason.to_owned(),
    }))
}

fn reject(session_id: &SessionId, reason: &str) -> Effect {
    Effect::Send(OutboundSignal::Reject(signaling::Reject {
        session_id: session_id.clone(),
        reason: reason.to_owned(),
    }))
}
