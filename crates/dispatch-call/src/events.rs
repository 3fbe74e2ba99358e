//! Notifications pushed to the UI layer.

use crate::error::EndReason;
use crate::session::MediaKind;
use dispatch_common::{PeerId, SessionId};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// An unsolicited call is ringing.
    Incoming {
        session_id: SessionId,
        peer_id: PeerId,
        peer_display_name: Option<String>,
        media_kind: MediaKind,
    },

    /// The session is gone. Sent exactly once per session.
    Ended {
        session_id: SessionId,
        reason: EndReason,
        /// Talk time, when the call reached `Active`.
        duration: Option<Duration>,
    },

    LocalStream {
        session_id: SessionId,
        media_kind: MediaKind,
    },

    RemoteStream {
        session_id: SessionId,
        media_kind: MediaKind,
    },

    RemoteMediaToggled {
        session_id: SessionId,
        media_kind: MediaKind,
        enabled: bool,
    },
}

impl CallEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            CallEvent::Incoming { session_id, .. }
            | CallEvent::Ended { session_id, .. }
            | CallEvent::LocalStream { session_id, .. }
            | CallEvent::RemoteStream { session_id, .. }
            | CallEvent::RemoteMediaToggled { session_id, .. } => session_id,
        }
    }
}
