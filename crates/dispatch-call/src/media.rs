//! Local media control: mute/unmute and camera on/off.

use crate::machine::{CallStateMachine, Effect};
use crate::negotiator::NegotiatorCommand;
use crate::session::{CallState, MediaKind};
use crate::signaling::{OutboundSignal, ToggleMedia};

impl CallStateMachine {
    /// Flip the local track of `kind`.
    ///
    /// Returns `false` without effects when there is no call or the call has
    /// no local track of that kind (video on an audio call, or media not yet
    /// acquired). The peer is told only once the call is connected.
    pub fn toggle_media(&mut self, kind: MediaKind, fx: &mut Vec<Effect>) -> bool {
        let Some(session) = self.session_mut() else {
            return false;
        };
        if !session.has_local_track(kind) {
            tracing::debug!(
                session = %session.session_id,
                kind = kind.as_str(),
                "No local track to toggle"
            );
            return false;
        }

        let enabled = !session.local_media.get(kind);
        session.local_media.set(kind, enabled);
        tracing::info!(
            session = %session.session_id,
            kind = kind.as_str(),
            enabled,
            "Local media toggled"
        );

        fx.push(Effect::Negotiate(NegotiatorCommand::SetTrackEnabled {
            session_id: session.session_id.clone(),
            kind,
            enabled,
        }));
        if session.state == CallState::Active && session.announced {
            fx.push(Effect::Send(OutboundSignal::ToggleMedia(ToggleMedia {
                session_id: session.session_id.clone(),
                target_peer_id: session.peer_id.clone(),
                media_kind: kind,
                enabled,
            })));
        }
        fx.push(Effect::Publish(session.snapshot()));
        true
    }

    pub fn toggle_audio(&mut self, fx: &mut Vec<Effect>) -> bool {
        self.toggle_media(MediaKind::Audio, fx)
    }

    pub fn toggle_video(&mut self, fx: &mut Vec<Effect>) -> bool {
        self.toggle_media(MediaKind::Video, fx)
    }
}

#[cfg(test)]
mod tests {
    use crate::machine::{CallConfig, CallContext, CallStateMachine, Effect};
    use crate::negotiator::SessionDescription;
    use crate::session::MediaKind;
    use crate::signaling::{Accepted, InboundSignal, OutboundSignal};
    use chrono::Utc;

    fn connected(kind: MediaKind) -> CallStateMachine {
        let mut m = CallStateMachine::new(CallConfig::default(), CallContext::new("customer-1"));
        let mut fx = Vec::new();
        let sid = m.start_call("driver-9".into(), None, kind, &mut fx).unwrap();
        m.description_ready(&sid, Ok(SessionDescription::offer("o")), Utc::now(), &mut fx)
            .unwrap();
        m.handle_signal(
            InboundSignal::Accepted(Accepted {
                session_id: Some(sid),
                answerer_id: None,
                answer: Some(SessionDescription::answer("a")),
            }),
            Utc::now(),
            &mut fx,
        );
        m
    }

    #[test]
    fn video_toggle_on_audio_call_is_refused() {
        let mut m = connected(MediaKind::Audio);
        let before = m.snapshot();
        let mut fx = Vec::new();

        assert!(!m.toggle_video(&mut fx));
        assert!(fx.is_empty());
        assert_eq!(m.snapshot(), before);
    }

    #[test]
    fn toggle_without_call_is_refused() {
        let mut m = CallStateMachine::new(CallConfig::default(), CallContext::new("customer-1"));
        let mut fx = Vec::new();
        assert!(!m.toggle_audio(&mut fx));
        assert!(fx.is_empty());
    }

    #[test]
    fn mute_notifies_peer_when_connected() {
        let mut m = connected(MediaKind::Video);
        let mut fx = Vec::new();

        assert!(m.toggle_audio(&mut fx));
        assert!(!m.snapshot().local_media.audio);
        assert!(m.snapshot().local_media.video);

        let toggles: Vec<_> = fx
            .iter()
            .filter_map(|e| match e {
                Effect::Send(OutboundSignal::ToggleMedia(t)) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(toggles.len(), 1);
        assert_eq!(toggles[0].media_kind, MediaKind::Audio);
        assert!(!toggles[0].enabled);

        fx.clear();
        assert!(m.toggle_audio(&mut fx));
        assert!(m.snapshot().local_media.audio);
    }

    #[test]
    fn toggle_while_dialing_stays_local() {
        let mut m = CallStateMachine::new(CallConfig::default(), CallContext::new("customer-1"));
        let mut fx = Vec::new();
        let sid = m
            .start_call("driver-9".into(), None, MediaKind::Video, &mut fx)
            .unwrap();
        m.description_ready(&sid, Ok(SessionDescription::offer("o")), Utc::now(), &mut fx)
            .unwrap();
        fx.clear();

        assert!(m.toggle_video(&mut fx));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Send(_))));
        assert!(fx.iter().any(|e| matches!(e, Effect::Negotiate(_))));
    }
}
