//! Error types for the call layer.
//!
//! [`CallError`] is what a rejected facade action returns. [`EndReason`] is why
//! a session ended; every failure resolves to a clean return to `Idle` and is
//! surfaced once, through `CallEvent::Ended`.

use crate::negotiator::NegotiatorError;
use crate::session::CallState;
use crate::signaling::SignalingError;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },

    #[error("Local media unavailable: {0}")]
    LocalMediaUnavailable(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The session was torn down while an asynchronous step was outstanding.
    #[error("Call was ended before the operation completed")]
    Superseded,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

impl From<NegotiatorError> for CallError {
    fn from(err: NegotiatorError) -> Self {
        match err {
            NegotiatorError::MediaUnavailable(msg) => CallError::LocalMediaUnavailable(msg),
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }
}

/// Which side ended a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Local,
    Remote,
}

/// Why a session left the non-idle states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndReason {
    #[error("Call ended")]
    Hangup { by: Party },

    #[error("The other party is offline")]
    PeerOffline,

    #[error("The other party is busy")]
    PeerBusy,

    #[error("Could not connect the call")]
    NegotiationFailed,

    #[error("No answer")]
    Timeout,

    #[error("Call declined")]
    Rejected,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Camera or microphone unavailable")]
    LocalMediaUnavailable,

    #[error("Call failed: {0}")]
    Other(String),
}

impl EndReason {
    /// Stable token used in outbound `reason` fields.
    pub fn wire_name(&self) -> &str {
        match self {
            EndReason::Hangup { .. } => "hangup",
            EndReason::PeerOffline => "peer_offline",
            EndReason::PeerBusy => "busy",
            EndReason::NegotiationFailed => "negotiation_failed",
            EndReason::Timeout => "timeout",
            EndReason::Rejected => "rejected",
            EndReason::Cancelled => "cancelled",
            EndReason::LocalMediaUnavailable => "media_unavailable",
            EndReason::Other(_) => "other",
        }
    }

    /// A normal hangup is not a failure; everything else the UI shows as one.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            EndReason::Hangup { .. } | EndReason::Rejected | EndReason::Cancelled
        )
    }
}
