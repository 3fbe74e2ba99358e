//! # dispatch-common
//!
//! Shared identifiers, configuration, and the raw signaling envelope used across
//! the Dispatch crates. No call logic lives here.

pub mod config;
pub mod ids;
pub mod signal_event;

pub use ids::{PeerId, SessionId};
pub use signal_event::SignalEnvelope;
