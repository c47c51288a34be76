//! obs-websocket v5 message envelope.
//!
//! Every frame on the wire is `{ "op": <u8>, "d": <payload> }`. The
//! relay only speaks the opcodes it needs: hello, identify, identified,
//! event, request, and request-response. Unknown opcodes are carried
//! through untouched so consumers can still observe them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default protocol version sent when the hello omits one.
pub const DEFAULT_RPC_VERSION: u32 = 1;

/// Wire opcodes for the subset of obs-websocket v5 the relay uses.
pub mod opcode {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
}

// ── Envelope ─────────────────────────────────────────────────────────

/// A raw device message: opcode plus payload.
///
/// Kept as loose JSON so every message -- including ones the relay does
/// not interpret -- can be forwarded verbatim to control-surface
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl Envelope {
    /// Build an identify message (op 1) answering a hello.
    pub fn identify(rpc_version: u32, authentication: Option<String>) -> Self {
        let mut d = serde_json::Map::new();
        d.insert("rpcVersion".into(), rpc_version.into());
        if let Some(auth) = authentication {
            d.insert("authentication".into(), auth.into());
        }
        Self {
            op: opcode::IDENTIFY,
            d: Value::Object(d),
        }
    }

    /// Build a correlated request message (op 6).
    pub fn request(request_id: Uuid, request_type: &str, request_data: Value) -> Self {
        let mut d = serde_json::Map::new();
        d.insert("requestType".into(), request_type.into());
        d.insert("requestId".into(), request_id.to_string().into());
        d.insert("requestData".into(), request_data);
        Self {
            op: opcode::REQUEST,
            d: Value::Object(d),
        }
    }

    /// Parse the payload as a hello (op 0). `None` for other opcodes or
    /// malformed payloads.
    pub fn hello(&self) -> Option<HelloPayload> {
        if self.op != opcode::HELLO {
            return None;
        }
        serde_json::from_value(self.d.clone()).ok()
    }

    /// Parse the payload as an event (op 5).
    pub fn event(&self) -> Option<EventPayload> {
        if self.op != opcode::EVENT {
            return None;
        }
        serde_json::from_value(self.d.clone()).ok()
    }

    /// Parse the payload as a request-response (op 7).
    ///
    /// Returns `None` when the status field is absent -- such a frame
    /// must not resolve a pending request.
    pub fn request_response(&self) -> Option<RequestResponsePayload> {
        if self.op != opcode::REQUEST_RESPONSE {
            return None;
        }
        serde_json::from_value(self.d.clone()).ok()
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

/// Hello (op 0): the device's greeting, optionally demanding auth.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default = "default_rpc_version")]
    pub rpc_version: u32,

    /// Present when the device requires challenge-response auth.
    #[serde(default)]
    pub authentication: Option<AuthChallenge>,
}

fn default_rpc_version() -> u32 {
    DEFAULT_RPC_VERSION
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

/// Event (op 5).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_type: String,

    #[serde(default)]
    pub event_data: Value,
}

impl EventPayload {
    /// The scene item targeted by this event, if any.
    pub fn scene_item_id(&self) -> Option<i64> {
        self.event_data.get("sceneItemId").and_then(Value::as_i64)
    }

    /// The scene (container) the event occurred in, if any.
    pub fn scene_uuid(&self) -> Option<&str> {
        self.event_data.get("sceneUuid").and_then(Value::as_str)
    }

    /// The item's enabled/visible flag carried by the event, if any.
    pub fn scene_item_enabled(&self) -> Option<bool> {
        self.event_data
            .get("sceneItemEnabled")
            .and_then(Value::as_bool)
    }
}

/// Request-response (op 7): the device's answer to a correlated request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponsePayload {
    #[serde(default)]
    pub request_type: String,

    pub request_id: String,

    pub request_status: RequestStatus,

    #[serde(default)]
    pub response_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestStatus {
    pub result: bool,

    #[serde(default)]
    pub code: Option<u16>,

    #[serde(default)]
    pub comment: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────────
