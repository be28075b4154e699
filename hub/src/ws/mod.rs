//! WebSocket replay protocol.
//!
//! Clients connect to `/v1/replay/stream`, send one
//! `{"type":"auth","data":{"channel":..,"token":..}}` envelope, and then
//! receive bare candle objects until the range is exhausted and the server
//! closes with `1000 "bye"`.

pub mod session;

use serde::Deserialize;
use serde_json::Value;

use crate::error::HubError;

pub use session::{run_session, SessionSettings, SessionState};

pub const MSG_TYPE_AUTH: &str = "auth";

/// Inbound frame envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::Protocol(format!("bad envelope: {e}")))
    }

    pub fn is_auth(&self) -> bool {
        self.msg_type == MSG_TYPE_AUTH
    }
}

/// Payload of an `auth` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthData {
    pub channel: String,
    pub token: String,
}

impl AuthData {
    pub fn from_value(data: Value) -> Result<Self, HubError> {
        serde_json::from_value(data).map_err(|e| HubError::Protocol(format!("bad auth data: {e}")))
    }
}
