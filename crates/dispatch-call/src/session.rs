//! Call session state, the single mutable aggregate of the call layer.
//!
//! At most one [`CallSession`] exists per local participant. It is owned by the
//! state machine and only ever handed out as a read-only [`CallSnapshot`].

use crate::negotiator::{IceCandidate, SessionDescription};
use chrono::{DateTime, Utc};
use dispatch_common::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle states. `Ending` and `Failed` are transient: they are published to
/// the UI and immediately resolve to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Active,
    Ending,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::Ending => "ending",
            CallState::Failed => "failed",
        }
    }

    /// Waiting on the other side to pick up (either direction).
    pub fn is_pending(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// What the call carries. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Per-kind enablement of a participant's tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaFlags {
    pub audio: bool,
    pub video: bool,
}

impl MediaFlags {
    /// Everything the call kind carries starts enabled.
    pub fn for_kind(kind: MediaKind) -> Self {
        Self {
            audio: true,
            video: kind == MediaKind::Video,
        }
    }

    pub fn get(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
        }
    }
}

/// The one in-flight call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub peer_id: PeerId,
    pub peer_display_name: Option<String>,
    pub state: CallState,
    pub local_media: MediaFlags,
    /// Last value reported by the peer.
    pub remote_media: MediaFlags,
    /// Set once, on first entry into `Active`.
    pub started_at: Option<DateTime<Utc>>,
    pub local_offer: Option<SessionDescription>,
    /// Offer carried by `call:incoming`, consumed when answering.
    pub remote_offer: Option<SessionDescription>,
    pub remote_answer: Option<SessionDescription>,
    /// `call:initiate` (caller) or `call:accept` (callee) has gone out.
    pub(crate) announced: bool,
    /// Local tracks exist, i.e. the negotiator produced our description.
    pub(crate) media_acquired: bool,
    /// The negotiator holds resources for this session and must be closed.
    pub(crate) negotiator_engaged: bool,
    pub(crate) pending_local_candidates: Vec<IceCandidate>,
    pub(crate) pending_remote_candidates: Vec<IceCandidate>,
}

impl CallSession {
    pub(crate) fn new(
        session_id: SessionId,
        role: CallRole,
        media_kind: MediaKind,
        peer_id: PeerId,
        peer_display_name: Option<String>,
    ) -> Self {
        let state = match role {
            CallRole::Caller => CallState::Dialing,
            CallRole::Callee => CallState::Ringing,
        };
        Self {
            session_id,
            role,
            media_kind,
            peer_id,
            peer_display_name,
            state,
            local_media: MediaFlags::for_kind(media_kind),
            remote_media: MediaFlags::for_kind(media_kind),
            started_at: None,
            local_offer: None,
            remote_offer: None,
            remote_answer: None,
            announced: false,
            media_acquired: false,
            negotiator_engaged: false,
            pending_local_candidates: Vec::new(),
            pending_remote_candidates: Vec::new(),
        }
    }

    /// Whether this session has a local track of the given kind.
    pub fn has_local_track(&self, kind: MediaKind) -> bool {
        self.media_acquired && (kind == MediaKind::Audio || self.media_kind == MediaKind::Video)
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.and_then(|start| (now - start).to_std().ok())
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: Some(self.session_id.clone()),
            state: self.state,
            role: Some(self.role),
            media_kind: Some(self.media_kind),
            peer_id: Some(self.peer_id.clone()),
            peer_display_name: self.peer_display_name.clone(),
            local_media: self.local_media,
            remote_media: self.remote_media,
            started_at: self.started_at,
        }
    }
}

/// Read-only projection handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub session_id: Option<SessionId>,
    pub state: CallState,
    pub role: Option<CallRole>,
    pub media_kind: Option<MediaKind>,
    pub peer_id: Option<PeerId>,
    pub peer_display_name: Option<String>,
    pub local_media: MediaFlags,
    pub remote_media: MediaFlags,
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: CallState::Idle,
            role: None,
            media_kind: None,
            peer_id: None,
            peer_display_name: None,
            local_media: MediaFlags::default(),
            remote_media: MediaFlags::default(),
            started_at: None,
        }
    }

    /// Elapsed talk time, for the in-call timer.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.and_then(|start| (now - start).to_std().ok())
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
