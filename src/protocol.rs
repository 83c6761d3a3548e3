//! Cloud relay envelope
//!
//! The relay carries the same frames as the LAN socket. Each frame travels
//! base64-encoded inside a small JSON envelope; the relay never looks inside.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope version sent in `hello`
pub const RELAY_VERSION: u32 = 1;

/// One relay message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Opens a relay session for one appliance
    Hello {
        id: Uuid,
        device: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        version: u32,
    },

    /// Relay accepted the session
    Welcome {
        session: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// An appliance frame in either direction
    Frame {
        /// Base64-encoded frame bytes
        data: String,
        /// Unix timestamp (seconds) of when the frame was sent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },

    /// Relay-side failure
    Error { detail: String },
}

impl RelayMessage {
    /// Create a new hello message
    pub fn hello(device: impl Into<String>, token: Option<String>) -> Self {
        Self::Hello {
            id: Uuid::new_v4(),
            device: device.into(),
            token,
            version: RELAY_VERSION,
        }
    }

    /// Wrap an outbound frame, stamped with the current time
    pub fn frame(bytes: &[u8]) -> Self {
        Self::Frame {
            data: STANDARD.encode(bytes),
            ts: Some(Utc::now().timestamp()),
        }
    }

    /// Decode the payload of a `frame` message
    ///
    /// Returns `None` for other message types; malformed base64 is an error.
    pub fn frame_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            Self::Frame { data, .. } => Some(STANDARD.decode(data)),
            _ => None,
        }
    }
}
