//! In-process stand-in for the media stack.
//!
//! Produces synthetic descriptions and candidates and reports streams the way
//! a real peer connection would, with a short delay for "device" acquisition.

use async_trait::async_trait;
use dispatch_call::{
    ConnectionState, IceCandidate, MediaKind, MediaNegotiator, NegotiatorError, NegotiatorEvent,
    NegotiatorEventKind, SessionDescription,
};
use dispatch_common::SessionId;
use std::time::Duration;
use tokio::sync::mpsc;

const ACQUIRE_DELAY: Duration = Duration::from_millis(150);

pub struct SimulatedNegotiator {
    label: &'static str,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl SimulatedNegotiator {
    pub fn new(label: &'static str, events: mpsc::UnboundedSender<NegotiatorEvent>) -> Self {
        Self { label, events }
    }

    fn emit(&self, session_id: &SessionId, kind: NegotiatorEventKind) {
        let _ = self.events.send(NegotiatorEvent {
            session_id: session_id.clone(),
            kind,
        });
    }

    /// Capture starts and host candidates are gathered.
    async fn acquire(&self, session_id: &SessionId, kind: MediaKind) {
        tokio::time::sleep(ACQUIRE_DELAY).await;
        self.emit(session_id, NegotiatorEventKind::LocalStream(MediaKind::Audio));
        if kind == MediaKind::Video {
            self.emit(session_id, NegotiatorEventKind::LocalStream(MediaKind::Video));
        }
        for (i, port) in [50000u16, 50002].into_iter().enumerate() {
            self.emit(
                session_id,
                NegotiatorEventKind::LocalCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:{i} 1 udp 2122260223 127.0.0.1 {port} typ host"
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                }),
            );
        }
    }

    fn sdp(&self, session_id: &SessionId, kind: MediaKind) -> String {
        let mut sdp = format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.label, session_id
        );
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        if kind == MediaKind::Video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn connected(&self, session_id: &SessionId, kind: MediaKind) {
        self.emit(session_id, NegotiatorEventKind::ConnectionState(ConnectionState::Connected));
        self.emit(session_id, NegotiatorEventKind::RemoteStream(kind));
    }
}

fn kind_of(description: &SessionDescription) -> MediaKind {
    if description.sdp.contains("m=video") {
        MediaKind::Video
    } else {
        MediaKind::Audio
    }
}

#[async_trait]
impl MediaNegotiator for SimulatedNegotiator {
    async fn create_offer(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
    ) -> Result<SessionDescription, NegotiatorError> {
        self.acquire(session_id, kind).await;
        Ok(SessionDescription::offer(self.sdp(session_id, kind)))
    }

    async fn create_answer(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        remote_offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription, NegotiatorError> {
        if remote_offer.is_none() {
            return Err(NegotiatorError::Negotiation("no offer to answer".into()));
        }
        self.acquire(session_id, kind).await;
        self.connected(session_id, kind);
        Ok(SessionDescription::answer(self.sdp(session_id, kind)))
    }

    async fn apply_answer(
        &self,
        session_id: &SessionId,
        answer: &SessionDescription,
    ) -> Result<(), NegotiatorError> {
        self.connected(session_id, kind_of(answer));
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        session_id: &SessionId,
        candidate: &IceCandidate,
    ) -> Result<(), NegotiatorError> {
        tracing::trace!(
            side = self.label,
            session = %session_id,
            candidate = %candidate.candidate,
            "Remote candidate"
        );
        Ok(())
    }

    async fn set_track_enabled(
        &self,
        session_id: &SessionId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), NegotiatorError> {
        tracing::debug!(
            side = self.label,
            session = %session_id,
            kind = kind.as_str(),
            enabled,
            "Track toggled"
        );
        Ok(())
    }

    async fn close(&self, session_id: &SessionId) -> Result<(), NegotiatorError> {
        self.emit(session_id, NegotiatorEventKind::ConnectionState(ConnectionState::Closed));
        Ok(())
    }
}
