//! Call signaling over the named-event channel.
//!
//! The signaling channel is already connected and authenticated; it delivers
//! `call:*` events with JSON payloads at most once per send, with no ordering
//! guarantee across reconnects. This module only handles the message shapes
//! and the send side:
//!
//! - inbound envelopes decode into [`InboundSignal`] (unknown events are `None`)
//! - [`OutboundSignal`] encodes into an envelope
//! - [`SignalingChannel`] is the send capability, [`ReliableSignaling`] adds a
//!   fallback channel behind it
//!
//! Payload fields are camelCase on the wire.

use crate::negotiator::{IceCandidate, SessionDescription};
use crate::session::MediaKind;
use dispatch_common::{PeerId, SessionId, SignalEnvelope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event names.
pub mod event {
    pub const INITIATED: &str = "call:initiated";
    pub const INCOMING: &str = "call:incoming";
    pub const ACCEPTED: &str = "call:accepted";
    pub const REJECTED: &str = "call:rejected";
    pub const ENDED: &str = "call:ended";
    pub const FAILED: &str = "call:failed";
    pub const CANCELLED: &str = "call:cancelled";
    pub const ICE_CANDIDATE: &str = "call:ice-candidate";
    pub const MEDIA_TOGGLED: &str = "call:media-toggled";

    pub const INITIATE: &str = "call:initiate";
    pub const ACCEPT: &str = "call:accept";
    pub const REJECT: &str = "call:reject";
    pub const END: &str = "call:end";
    pub const TOGGLE_MEDIA: &str = "call:toggle-media";
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("Signaling channel is closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

// === Inbound payloads ===

/// Server ack of our `call:initiate`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiated {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub target_peer_id: Option<PeerId>,
    #[serde(default = "default_true")]
    pub peer_online: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incoming {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub caller_id: PeerId,
    #[serde(default)]
    pub caller_display_name: Option<String>,
    pub media_kind: MediaKind,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub answerer_id: Option<PeerId>,
    #[serde(default, alias = "remoteAnswer")]
    pub answer: Option<SessionDescription>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejected {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub rejected_by: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ended {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub ended_by: Option<PeerId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PeerOffline,
    PeerBusy,
    Timeout,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failed {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancelled {
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCandidate {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaToggled {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub media_kind: MediaKind,
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Signaling events consumed by the call layer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Initiated(Initiated),
    Incoming(Incoming),
    Accepted(Accepted),
    Rejected(Rejected),
    Ended(Ended),
    Failed(Failed),
    Cancelled(Cancelled),
    IceCandidate(RemoteCandidate),
    MediaToggled(MediaToggled),
}

impl InboundSignal {
    /// Decode an envelope. Events outside the call namespace yield `Ok(None)`.
    pub fn decode(envelope: &SignalEnvelope) -> Result<Option<Self>, SignalingError> {
        let data = envelope.data.clone();
        let signal = match envelope.event.as_str() {
            event::INITIATED => Self::Initiated(serde_json::from_value(data)?),
            event::INCOMING => Self::Incoming(serde_json::from_value(data)?),
            event::ACCEPTED => Self::Accepted(serde_json::from_value(data)?),
            event::REJECTED => Self::Rejected(serde_json::from_value(data)?),
            event::ENDED => Self::Ended(serde_json::from_value(data)?),
            event::FAILED => Self::Failed(serde_json::from_value(data)?),
            event::CANCELLED => Self::Cancelled(serde_json::from_value(data)?),
            event::ICE_CANDIDATE => Self::IceCandidate(serde_json::from_value(data)?),
            event::MEDIA_TOGGLED => Self::MediaToggled(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initiated(_) => event::INITIATED,
            Self::Incoming(_) => event::INCOMING,
            Self::Accepted(_) => event::ACCEPTED,
            Self::Rejected(_) => event::REJECTED,
            Self::Ended(_) => event::ENDED,
            Self::Failed(_) => event::FAILED,
            Self::Cancelled(_) => event::CANCELLED,
            Self::IceCandidate(_) => event::ICE_CANDIDATE,
            Self::MediaToggled(_) => event::MEDIA_TOGGLED,
        }
    }

    /// The correlation key carried by the event, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Initiated(p) => p.session_id.as_ref(),
            Self::Incoming(p) => p.session_id.as_ref(),
            Self::Accepted(p) => p.session_id.as_ref(),
            Self::Rejected(p) => p.session_id.as_ref(),
            Self::Ended(p) => p.session_id.as_ref(),
            Self::Failed(p) => p.session_id.as_ref(),
            Self::Cancelled(p) => p.session_id.as_ref(),
            Self::IceCandidate(p) => p.session_id.as_ref(),
            Self::MediaToggled(p) => p.session_id.as_ref(),
        }
    }
}

// === Outbound payloads ===

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiate {
    pub session_id: SessionId,
    pub caller_id: PeerId,
    pub peer_id: PeerId,
    pub media_kind: MediaKind,
    pub offer: SessionDescription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    pub session_id: SessionId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct End {
    pub session_id: SessionId,
    pub target_peer_id: PeerId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCandidate {
    pub session_id: SessionId,
    pub target_peer_id: PeerId,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleMedia {
    pub session_id: SessionId,
    pub target_peer_id: PeerId,
    pub media_kind: MediaKind,
    pub enabled: bool,
}

/// Signaling messages emitted by the call layer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Initiate(Initiate),
    Accept(Accept),
    Reject(Reject),
    End(End),
    IceCandidate(LocalCandidate),
    ToggleMedia(ToggleMedia),
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Initiate(_) => event::INITIATE,
            Self::Accept(_) => event::ACCEPT,
            Self::Reject(_) => event::REJECT,
            Self::End(_) => event::END,
            Self::IceCandidate(_) => event::ICE_CANDIDATE,
            Self::ToggleMedia(_) => event::TOGGLE_MEDIA,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Initiate(p) => &p.session_id,
            Self::Accept(p) => &p.session_id,
            Self::Reject(p) => &p.session_id,
            Self::End(p) => &p.session_id,
            Self::IceCandidate(p) => &p.session_id,
            Self::ToggleMedia(p) => &p.session_id,
        }
    }

    /// Terminal messages close the session on the peer's side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reject(_) | Self::End(_))
    }

    pub fn to_envelope(&self) -> Result<SignalEnvelope, SignalingError> {
        let data = match self {
            Self::Initiate(p) => serde_json::to_value(p)?,
            Self::Accept(p) => serde_json::to_value(p)?,
            Self::Reject(p) => serde_json::to_value(p)?,
            Self::End(p) => serde_json::to_value(p)?,
            Self::IceCandidate(p) => serde_json::to_value(p)?,
            Self::ToggleMedia(p) => serde_json::to_value(p)?,
        };
        Ok(SignalEnvelope::new(self.event_name(), data))
    }
}

/// Send side of the signaling channel.
///
/// `send` must not block: it hands the envelope to the transport and returns.
/// The call layer sends while holding its state lock so that message order
/// matches transition order.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}

impl SignalingChannel for mpsc::UnboundedSender<SignalEnvelope> {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        mpsc::UnboundedSender::send(self, envelope).map_err(|_| SignalingError::Closed)
    }
}

/// Primary channel with a fallback.
///
/// Every message goes out once on the primary; only if that fails is it handed
/// to the fallback (e.g. the REST relay when the socket is reconnecting).
#[derive(Clone)]
pub struct ReliableSignaling {
    primary: Arc<dyn SignalingChannel>,
    fallback: Arc<dyn SignalingChannel>,
}

impl ReliableSignaling {
    pub fn new(primary: Arc<dyn SignalingChannel>, fallback: Arc<dyn SignalingChannel>) -> Self {
        Self { primary, fallback }
    }
}

impl SignalingChannel for ReliableSignaling {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        match self.primary.send(envelope.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    event = %envelope.event,
                    session = ?envelope.session_id(),
                    error = %e,
                    "Primary signaling channel failed, using fallback"
                );
                self.fallback.send(envelope)
            }
        }
    }
}
