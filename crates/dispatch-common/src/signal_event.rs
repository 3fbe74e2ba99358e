//! Raw signaling envelope, as it crosses the signaling channel.
//!
//! The channel delivers named events with JSON payloads. The call layer decodes
//! these into typed messages; this module lives in `dispatch-common` so the
//! transport side can produce envelopes without depending on call logic.

use serde::{Deserialize, Serialize};

/// A named event with a JSON payload (e.g. `"call:incoming"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Event name, including the `call:` namespace.
    pub event: String,
    /// Event payload as JSON
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SignalEnvelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// `sessionId` of the payload, as text, if present.
    pub fn session_id(&self) -> Option<String> {
        match self.data.get("sessionId")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
