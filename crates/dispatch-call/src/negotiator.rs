//! Media session negotiation: the boundary to the real-time media stack.
//!
//! The call layer never touches media itself. It drives a [`MediaNegotiator`]
//! through offer/answer and candidate exchange:
//!
//! ```text
//!   Caller                              Callee
//!   create_offer ──call:initiate──▶     (Ringing)
//!                                       create_answer
//!   apply_answer ◀──call:accept────
//!   candidates   ◀──call:ice-candidate──▶ candidates
//!   close        ────call:end──────▶    close
//! ```
//!
//! Everything the negotiator reports back (local candidates, stream
//! availability, connection state) arrives as [`NegotiatorEvent`]s tagged with
//! the session they belong to, so late callbacks for a finished session can be
//! recognised and dropped.

use crate::session::MediaKind;
use async_trait::async_trait;
use dispatch_common::SessionId;
use serde::{Deserialize, Serialize};

/// Offer or answer, in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A connectivity candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NegotiatorError {
    /// Camera or microphone could not be acquired.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Negotiator is closed")]
    Closed,
}

/// The media stack as seen from the call layer.
///
/// Every method is scoped to a session id; implementations may keep one
/// peer connection per session and must tolerate `close` for a session whose
/// creation is still in flight or already failed.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Acquire local media and produce an offer.
    async fn create_offer(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
    ) -> Result<SessionDescription, NegotiatorError>;

    /// Acquire local media and answer the caller's offer.
    async fn create_answer(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        remote_offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription, NegotiatorError>;

    async fn apply_answer(
        &self,
        session_id: &SessionId,
        answer: &SessionDescription,
    ) -> Result<(), NegotiatorError>;

    async fn add_remote_candidate(
        &self,
        session_id: &SessionId,
        candidate: &IceCandidate,
    ) -> Result<(), NegotiatorError>;

    /// Enable or disable the local track of one kind.
    async fn set_track_enabled(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), NegotiatorError>;

    /// Release all local media and transport resources for the session.
    async fn close(&self, session_id: &SessionId) -> Result<(), NegotiatorError>;
}

/// Work the state machine asks of the negotiator.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorCommand {
    CreateOffer {
        session_id: SessionId,
        kind: MediaKind,
    },
    CreateAnswer {
        session_id: SessionId,
        kind: MediaKind,
        remote_offer: Option<SessionDescription>,
    },
    ApplyAnswer {
        session_id: SessionId,
        answer: SessionDescription,
    },
    AddRemoteCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    SetTrackEnabled {
        session_id: SessionId,
        kind: MediaKind,
        enabled: bool,
    },
    Close {
        session_id: SessionId,
    },
}

impl NegotiatorCommand {
    pub fn session_id(&self) -> &SessionId {
        match self {
            NegotiatorCommand::CreateOffer { session_id, .. }
            | NegotiatorCommand::CreateAnswer { session_id, .. }
            | NegotiatorCommand::ApplyAnswer { session_id, .. }
            | NegotiatorCommand::AddRemoteCandidate { session_id, .. }
            | NegotiatorCommand::SetTrackEnabled { session_id, .. }
            | NegotiatorCommand::Close { session_id } => session_id,
        }
    }

    /// Offer/answer creation; the caller waits for the result.
    pub fn produces_description(&self) -> bool {
        matches!(
            self,
            NegotiatorCommand::CreateOffer { .. } | NegotiatorCommand::CreateAnswer { .. }
        )
    }
}

/// Transport connectivity as reported by the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback from the negotiator.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatorEvent {
    pub session_id: SessionId,
    pub kind: NegotiatorEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEventKind {
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    /// A local track is capturing.
    LocalStream(MediaKind),
    /// The peer's track is playable.
    RemoteStream(MediaKind),
    ConnectionState(ConnectionState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let bare: IceCandidate =
            serde_json::from_value(serde_json::json!({ "candidate": "c" })).unwrap();
        assert_eq!(bare, IceCandidate::new("c"));
    }

    #[test]
    fn description_type_field() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "offer", "sdp": "v=0" }));
    }
}
