//! Loopback signaling relay between two local participants.
//!
//! Plays the part of the signaling server: acknowledges `call:initiate` to the
//! caller and turns every outbound `call:*` message into the inbound event the
//! other side expects.

use dispatch_call::signaling::event;
use dispatch_common::SignalEnvelope;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc;

/// A participant as the relay sees it: name, what it sends, where it listens.
pub type Endpoint = (
    &'static str,
    mpsc::UnboundedReceiver<SignalEnvelope>,
    mpsc::UnboundedSender<SignalEnvelope>,
);

/// Messages produced for one outbound message.
#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    /// Back to the sender.
    pub reply: Option<SignalEnvelope>,
    /// To the other participant.
    pub forward: Option<SignalEnvelope>,
}

#[derive(Debug, Default)]
pub struct LoopbackRelay {
    /// Sessions that were accepted, with the time of the accept.
    connected: HashMap<String, Instant>,
    closed: HashSet<String>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one message sent by `from`.
    pub fn route(&mut self, from: &str, envelope: SignalEnvelope) -> Routed {
        let key = envelope.session_id().unwrap_or_default();
        let data = envelope.data;
        let session_id = data.get("sessionId").cloned().unwrap_or(Value::Null);

        if envelope.event != event::INITIATE && self.is_closed(&key) {
            tracing::debug!(
                event = %envelope.event,
                session = %key,
                "Relay dropping message for closed session"
            );
            return Routed::default();
        }

        match envelope.event.as_str() {
            event::INITIATE => Routed {
                reply: Some(SignalEnvelope::new(
                    event::INITIATED,
                    json!({
                        "sessionId": session_id,
                        "targetPeerId": data.get("peerId"),
                        "peerOnline": true,
                    }),
                )),
                forward: Some(SignalEnvelope::new(
                    event::INCOMING,
                    json!({
                        "sessionId": session_id,
                        "callerId": data.get("callerId"),
                        "callerDisplayName": from,
                        "mediaKind": data.get("mediaKind"),
                        "offer": data.get("offer"),
                    }),
                )),
            },
            event::ACCEPT => {
                self.connected.insert(key, Instant::now());
                forward(
                    event::ACCEPTED,
                    json!({
                        "sessionId": session_id,
                        "answererId": from,
                        "answer": data.get("answer"),
                    }),
                )
            }
            event::REJECT => {
                self.closed.insert(key);
                forward(
                    event::REJECTED,
                    json!({
                        "sessionId": session_id,
                        "reason": data.get("reason"),
                        "rejectedBy": from,
                    }),
                )
            }
            event::END => {
                self.closed.insert(key.clone());
                match self.connected.remove(&key) {
                    Some(since) => forward(
                        event::ENDED,
                        json!({
                            "sessionId": session_id,
                            "endedBy": from,
                            "reason": data.get("reason"),
                            "durationSeconds": since.elapsed().as_secs(),
                        }),
                    ),
                    None => forward(event::CANCELLED, json!({ "sessionId": session_id })),
                }
            }
            event::ICE_CANDIDATE => forward(
                event::ICE_CANDIDATE,
                json!({
                    "sessionId": session_id,
                    "candidate": data.get("candidate"),
                }),
            ),
            event::TOGGLE_MEDIA => forward(
                event::MEDIA_TOGGLED,
                json!({
                    "sessionId": session_id,
                    "mediaKind": data.get("mediaKind"),
                    "enabled": data.get("enabled"),
                }),
            ),
            other => {
                tracing::warn!(event = other, "Relay dropping unknown message");
                Routed::default()
            }
        }
    }

    fn is_closed(&self, session_id: &str) -> bool {
        self.closed.contains(session_id)
    }

    /// Pump both directions until either side's outbound channel closes.
    pub async fn run(mut self, caller: Endpoint, callee: Endpoint) {
        let (caller_name, mut caller_out, caller_in) = caller;
        let (callee_name, mut callee_out, callee_in) = callee;

        loop {
            let (from, envelope, back, onward) = tokio::select! {
                Some(envelope) = caller_out.recv() => {
                    (caller_name, envelope, &caller_in, &callee_in)
                }
                Some(envelope) = callee_out.recv() => {
                    (callee_name, envelope, &callee_in, &caller_in)
                }
                else => break,
            };

            tracing::debug!(from, event = %envelope.event, "Relaying");
            let routed = self.route(from, envelope);
            if let Some(reply) = routed.reply {
                let _ = back.send(reply);
            }
            if let Some(forward) = routed.forward {
                let _ = onward.send(forward);
            }
        }

        tracing::debug!("Relay stopped");
    }
}

fn forward(name: &str, data: Value) -> Routed {
    Routed {
        reply: None,
        forward: Some(SignalEnvelope::new(name, data)),
    }
}
