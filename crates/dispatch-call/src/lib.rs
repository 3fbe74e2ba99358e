//! # dispatch-call
//!
//! One-to-one voice/video calling between a customer and a service provider.
//!
//! Architecture: single-session state machine behind a facade
//! - At most one call per local participant, identified by a server `sessionId`
//! - Pure transition table ([`machine`]) emitting effects; the facade
//!   ([`client`]) carries them out under one lock
//! - Signaling is a named-event channel (`call:*`); media negotiation sits
//!   behind the [`negotiator::MediaNegotiator`] trait
//! - Events for finished sessions are recognised by id and dropped
//!
//! Every way a call can end (hangup, rejection, timeout, peer offline, media
//! failure) returns the session to `Idle` and is reported once as
//! [`CallEvent::Ended`].

pub mod client;
pub mod dedup;
pub mod error;
pub mod events;
pub mod machine;
pub mod media;
pub mod negotiator;
pub mod session;
pub mod signaling;

pub use client::CallClient;
pub use error::{CallError, EndReason, Party};
pub use events::CallEvent;
pub use machine::{CallConfig, CallContext, CallStateMachine, Effect};
pub use negotiator::{
    ConnectionState, IceCandidate, MediaNegotiator, NegotiatorError, NegotiatorEvent,
    NegotiatorEventKind, SessionDescription,
};
pub use session::{CallRole, CallSnapshot, CallState, MediaFlags, MediaKind};
pub use signaling::{ReliableSignaling, SignalingChannel, SignalingError};
