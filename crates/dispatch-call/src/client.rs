//! The call facade used by the UI layer.
//!
//! [`CallClient`] owns the state machine behind an async mutex and carries out
//! the effects of every transition while still holding it, so outbound
//! messages leave in transition order. Negotiator work runs on a dedicated
//! worker task, one command at a time in the order it was requested. An
//! offer/answer that never resolves is cut off after the ring timeout, and a
//! `Close` for its session abandons it early:
//!
//! ```text
//!   UI / signaling / timers ──▶ lock ──▶ CallStateMachine ──▶ effects
//!                                                   │
//!        signaling.send ◀────────────────────────────┤
//!        watch (snapshot) / broadcast (events) ◀─────┤
//!        negotiator worker ◀── mpsc ─────────────────┘
//!                 │
//!                 └── offer/answer reply ──▶ awaited outside the lock
//! ```
//!
//! Offer and answer creation is awaited outside the lock, so signaling events
//! (e.g. the caller cancelling) keep flowing while media is being acquired.
//! The result is re-applied against the session id it was requested for.

use crate::error::{CallError, EndReason};
use crate::events::CallEvent;
use crate::machine::{CallConfig, CallContext, CallStateMachine, Effect};
use crate::negotiator::{
    ConnectionState, MediaNegotiator, NegotiatorCommand, NegotiatorError, NegotiatorEvent,
    NegotiatorEventKind, SessionDescription,
};
use crate::session::{CallSnapshot, MediaKind};
use crate::signaling::{InboundSignal, SignalingChannel, SignalingError};
use chrono::Utc;
use dispatch_common::{PeerId, SessionId, SignalEnvelope};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

type DescriptionReply = oneshot::Sender<Result<SessionDescription, NegotiatorError>>;
type PendingDescription = oneshot::Receiver<Result<SessionDescription, NegotiatorError>>;

struct NegotiatorJob {
    command: NegotiatorCommand,
    reply: Option<DescriptionReply>,
}

/// What carrying out a batch of effects produced.
#[derive(Default)]
struct Applied {
    description: Option<PendingDescription>,
    /// Outcome of each `Send`, in order.
    sends: Vec<Result<(), SignalingError>>,
}

struct Inner {
    this: Weak<Inner>,
    machine: Mutex<CallStateMachine>,
    signaling: Arc<dyn SignalingChannel>,
    negotiator: mpsc::UnboundedSender<NegotiatorJob>,
    state: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    description_timeout: Duration,
}

/// Handle to the call layer. Cheap to clone.
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<Inner>,
}

impl CallClient {
    /// Build the call layer and start its negotiator worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: CallConfig,
        context: CallContext,
        signaling: Arc<dyn SignalingChannel>,
        negotiator: Arc<dyn MediaNegotiator>,
    ) -> Self {
        let (state, _) = watch::channel(CallSnapshot::idle());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let description_timeout = config.ring_timeout;

        tracing::info!(
            user = %context.local_user_id,
            room = ?context.room_id,
            ring_timeout_secs = config.ring_timeout.as_secs(),
            "Call layer ready"
        );

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_negotiator(
                negotiator,
                jobs_rx,
                this.clone(),
                description_timeout,
            ));
            Inner {
                this: this.clone(),
                machine: Mutex::new(CallStateMachine::new(config, context)),
                signaling,
                negotiator: jobs_tx,
                state,
                events,
                description_timeout,
            }
        });

        Self { inner }
    }

    // === UI actions ===

    pub async fn start_call(
        &self,
        peer_id: impl Into<PeerId>,
        kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        self.start_call_with(peer_id, None, kind).await
    }

    /// Place a call. Resolves once `call:initiate` has gone out, or with the
    /// reason the call could not be placed.
    pub async fn start_call_with(
        &self,
        peer_id: impl Into<PeerId>,
        peer_display_name: Option<String>,
        kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let (session_id, pending) = {
            let mut machine = self.inner.machine.lock().await;
            let mut fx = Vec::new();
            let session_id = machine.start_call(peer_id.into(), peer_display_name, kind, &mut fx)?;
            (session_id, self.inner.apply(fx).description)
        };

        self.complete_description(&session_id, pending).await?;
        Ok(session_id)
    }

    /// Answer the ringing call. Resolves once `call:accept` has gone out.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (session_id, pending) = {
            let mut machine = self.inner.machine.lock().await;
            let mut fx = Vec::new();
            let session_id = machine.accept_call(Utc::now(), &mut fx)?;
            (session_id, self.inner.apply(fx).description)
        };

        self.complete_description(&session_id, pending).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        machine.reject_call(Utc::now(), &mut fx)?;
        self.inner.apply(fx);
        Ok(())
    }

    /// Hang up, cancel or decline, whichever applies. The session is released
    /// locally even if the peer cannot be told.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        machine.end_call(Utc::now(), &mut fx)?;
        self.inner.apply(fx);
        Ok(())
    }

    /// Mute/unmute. Returns `false` if there is no audio track to toggle.
    pub async fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio).await
    }

    /// Camera on/off. Returns `false` on audio-only calls.
    pub async fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video).await
    }

    async fn toggle(&self, kind: MediaKind) -> bool {
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        let toggled = machine.toggle_media(kind, &mut fx);
        self.inner.apply(fx);
        toggled
    }

    // === Observation ===

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Latest-value view of the session. Transient states may be skipped by a
    /// slow reader; [`CallEvent::Ended`] is the authoritative end signal.
    pub fn subscribe_state(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    // === Inbound ===

    /// Feed one signaling event. Returns whether it changed anything.
    pub async fn handle_signal(&self, envelope: &SignalEnvelope) -> Result<bool, SignalingError> {
        let Some(signal) = InboundSignal::decode(envelope)? else {
            tracing::trace!(event = %envelope.event, "Ignoring non-call event");
            return Ok(false);
        };

        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        let applied = machine.handle_signal(signal, Utc::now(), &mut fx);
        self.inner.apply(fx);
        Ok(applied)
    }

    /// Feed one negotiator callback. Returns whether it changed anything.
    pub async fn handle_negotiator_event(&self, event: NegotiatorEvent) -> bool {
        let NegotiatorEvent { session_id, kind } = event;
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();

        let applied = match kind {
            NegotiatorEventKind::LocalCandidate(candidate) => {
                machine.local_candidate(&session_id, candidate, &mut fx)
            }
            NegotiatorEventKind::LocalStream(kind) => {
                machine.local_stream(&session_id, kind, &mut fx)
            }
            NegotiatorEventKind::RemoteStream(kind) => {
                machine.remote_stream(&session_id, kind, &mut fx)
            }
            NegotiatorEventKind::ConnectionState(ConnectionState::Failed) => machine
                .negotiation_failed(&session_id, "connection failed", Utc::now(), &mut fx),
            NegotiatorEventKind::ConnectionState(state) => {
                tracing::debug!(session = %session_id, ?state, "Connection state changed");
                false
            }
        };

        self.inner.apply(fx);
        applied
    }

    /// Drive [`handle_signal`](Self::handle_signal) from a channel until it closes.
    pub fn spawn_signaling(
        &self,
        mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                if let Err(e) = client.handle_signal(&envelope).await {
                    tracing::warn!(
                        event = %envelope.event,
                        error = %e,
                        "Dropping malformed signaling event"
                    );
                }
            }
            tracing::debug!("Signaling stream closed");
        })
    }

    /// Drive [`handle_negotiator_event`](Self::handle_negotiator_event) from a
    /// channel until it closes.
    pub fn spawn_negotiator_events(
        &self,
        mut events: mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                client.handle_negotiator_event(event).await;
            }
            tracing::debug!("Negotiator event stream closed");
        })
    }

    // === Internal ===

    /// Await the offer/answer requested for `session_id` and apply it.
    async fn complete_description(
        &self,
        session_id: &SessionId,
        pending: Option<PendingDescription>,
    ) -> Result<(), CallError> {
        let result = match pending {
            Some(reply) => match tokio::time::timeout(self.inner.description_timeout, reply).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(NegotiatorError::Closed),
                Err(_) => Err(NegotiatorError::Negotiation(
                    "timed out producing local description".into(),
                )),
            },
            None => Err(NegotiatorError::Closed),
        };

        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        let outcome = machine.description_ready(session_id, result, Utc::now(), &mut fx);
        let applied = self.inner.apply(fx);
        outcome?;

        // The first send is the announcement itself.
        if let Some(Err(e)) = applied.sends.into_iter().next() {
            tracing::warn!(
                session = %session_id,
                error = %e,
                "Could not announce call, abandoning"
            );
            let mut fx = Vec::new();
            machine.abandon(
                session_id,
                EndReason::Other(format!("signaling unavailable: {e}")),
                Utc::now(),
                &mut fx,
            );
            self.inner.apply(fx);
            return Err(CallError::Signaling(e));
        }
        Ok(())
    }

    async fn ring_timeout(&self, session_id: &SessionId) {
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        if machine.ring_timeout(session_id, Utc::now(), &mut fx) {
            self.inner.apply(fx);
        }
    }

    async fn negotiation_failed(&self, session_id: &SessionId, detail: &str) {
        let mut machine = self.inner.machine.lock().await;
        let mut fx = Vec::new();
        machine.negotiation_failed(session_id, detail, Utc::now(), &mut fx);
        self.inner.apply(fx);
    }
}

impl Inner {
    /// Carry out effects in order. Called with the machine lock held.
    fn apply(&self, effects: Vec<Effect>) -> Applied {
        let mut applied = Applied::default();

        for effect in effects {
            match effect {
                Effect::Send(signal) => {
                    let result = signal
                        .to_envelope()
                        .and_then(|envelope| self.signaling.send(envelope));
                    match &result {
                        Ok(()) => tracing::debug!(
                            event = signal.event_name(),
                            session = %signal.session_id(),
                            "Sent signaling message"
                        ),
                        Err(e) => tracing::warn!(
                            event = signal.event_name(),
                            session = %signal.session_id(),
                            error = %e,
                            "Failed to send signaling message"
                        ),
                    }
                    applied.sends.push(result);
                }
                Effect::Negotiate(command) => {
                    let reply = if command.produces_description() {
                        let (tx, rx) = oneshot::channel();
                        applied.description = Some(rx);
                        Some(tx)
                    } else {
                        None
                    };
                    if self.negotiator.send(NegotiatorJob { command, reply }).is_err() {
                        tracing::error!("Negotiator worker has stopped");
                    }
                }
                Effect::Notify(event) => {
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
                Effect::Publish(snapshot) => {
                    self.state.send_replace(snapshot);
                }
                Effect::ArmTimer { session_id, after } => self.arm_ring_timer(session_id, after),
            }
        }

        applied
    }

    fn arm_ring_timer(&self, session_id: SessionId, after: Duration) {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = this.upgrade() {
                CallClient { inner }.ring_timeout(&session_id).await;
            }
        });
    }
}

/// Runs negotiator commands sequentially until the client is dropped.
async fn run_negotiator(
    negotiator: Arc<dyn MediaNegotiator>,
    mut jobs: mpsc::UnboundedReceiver<NegotiatorJob>,
    client: Weak<Inner>,
    description_timeout: Duration,
) {
    // Jobs taken off the queue while an offer/answer was pending.
    let mut backlog = VecDeque::new();

    loop {
        let job = match backlog.pop_front() {
            Some(job) => job,
            None => match jobs.recv().await {
                Some(job) => job,
                None => break,
            },
        };
        let NegotiatorJob { command, reply } = job;

        match command {
            NegotiatorCommand::CreateOffer { session_id, kind } => {
                let request = negotiator.create_offer(&session_id, kind);
                let result = await_description(
                    request,
                    &session_id,
                    description_timeout,
                    &mut jobs,
                    &mut backlog,
                )
                .await;
                deliver(reply, result);
            }
            NegotiatorCommand::CreateAnswer {
                session_id,
                kind,
                remote_offer,
            } => {
                let request = negotiator.create_answer(&session_id, kind, remote_offer.as_ref());
                let result = await_description(
                    request,
                    &session_id,
                    description_timeout,
                    &mut jobs,
                    &mut backlog,
                )
                .await;
                deliver(reply, result);
            }
            NegotiatorCommand::ApplyAnswer { session_id, answer } => {
                if let Err(e) = negotiator.apply_answer(&session_id, &answer).await {
                    tracing::warn!(
                        session = %session_id,
                        error = %e,
                        "Failed to apply remote answer"
                    );
                    let Some(inner) = client.upgrade() else {
                        break;
                    };
                    CallClient { inner }
                        .negotiation_failed(&session_id, &e.to_string())
                        .await;
                }
            }
            NegotiatorCommand::AddRemoteCandidate {
                session_id,
                candidate,
            } => {
                if let Err(e) = negotiator.add_remote_candidate(&session_id, &candidate).await {
                    tracing::warn!(
                        session = %session_id,
                        error = %e,
                        "Failed to add remote candidate"
                    );
                }
            }
            NegotiatorCommand::SetTrackEnabled {
                session_id,
                kind,
                enabled,
            } => {
                if let Err(e) = negotiator.set_track_enabled(&session_id, kind, enabled).await {
                    tracing::warn!(
                        session = %session_id,
                        kind = kind.as_str(),
                        error = %e,
                        "Failed to toggle local track"
                    );
                }
            }
            NegotiatorCommand::Close { session_id } => {
                match negotiator.close(&session_id).await {
                    Ok(()) => tracing::debug!(session = %session_id, "Released call media"),
                    Err(e) => tracing::warn!(
                        session = %session_id,
                        error = %e,
                        "Failed to release call media"
                    ),
                }
            }
        }
    }
    tracing::debug!("Negotiator worker stopped");
}

/// Wait for an offer/answer, bounded by `limit`, while still draining the
/// queue. A `Close` for the same session drops the request; every job taken
/// off the queue meanwhile is kept in order in `backlog`.
async fn await_description<F>(
    request: F,
    session_id: &SessionId,
    limit: Duration,
    jobs: &mut mpsc::UnboundedReceiver<NegotiatorJob>,
    backlog: &mut VecDeque<NegotiatorJob>,
) -> Result<SessionDescription, NegotiatorError>
where
    F: Future<Output = Result<SessionDescription, NegotiatorError>>,
{
    if backlog.iter().any(|job| closes_session(job, session_id)) {
        return Err(NegotiatorError::Closed);
    }

    let request = tokio::time::timeout(limit, request);
    tokio::pin!(request);
    let mut open = true;

    loop {
        tokio::select! {
            outcome = &mut request => {
                return outcome.unwrap_or_else(|_| {
                    tracing::warn!(session = %session_id, "Local description timed out");
                    Err(NegotiatorError::Negotiation(
                        "timed out producing local description".into(),
                    ))
                });
            }
            job = jobs.recv(), if open => match job {
                Some(job) => {
                    let closes = closes_session(&job, session_id);
                    backlog.push_back(job);
                    if closes {
                        tracing::debug!(
                            session = %session_id,
                            "Session closed before its description was ready"
                        );
                        return Err(NegotiatorError::Closed);
                    }
                }
                None => open = false,
            },
        }
    }
}

fn closes_session(job: &NegotiatorJob, session_id: &SessionId) -> bool {
    matches!(job.command, NegotiatorCommand::Close { .. }) && job.command.session_id() == session_id
}

fn deliver(reply: Option<DescriptionReply>, result: Result<SessionDescription, NegotiatorError>) {
    if let Some(reply) = reply {
        // The requester may have timed out and gone.
        let _ = reply.send(result);
    }
}
