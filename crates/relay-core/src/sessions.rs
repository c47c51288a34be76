//! Control-surface session registry and the wire messages it fans out.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::model::ProfileSummary;
use relay_obs::DisconnectReason;

// ── Wire messages ────────────────────────────────────────────────────

/// Everything the relay pushes to a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    RelayConnectionStatus(ConnectionStatus),
    RelayObsStatus(ObsStatus),
    RelayConnectionProfiles(Vec<ProfileSummary>),
    ObsMessage(Value),
    RelayError(RelayErrorReport),
}

/// Everything a session may send to the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SwitchProfile { id: Uuid },
}

/// Session-level status, sent once when a session attaches or when its
/// authorization is refused.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<SessionId>,
}

impl ConnectionStatus {
    pub fn connected(client_id: SessionId) -> Self {
        Self {
            status: "connected",
            client_id: Some(client_id),
        }
    }

    pub fn auth_failed() -> Self {
        Self {
            status: "auth_failed",
            client_id: None,
        }
    }
}

/// A rejected session command, reported back to the sender only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayErrorReport {
    pub message: String,
}

/// Device connection status as sessions see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsStatus {
    pub connection: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The id/name pair sessions use to label a status line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRef {
    pub id: Uuid,
    pub name: String,
}

impl ObsStatus {
    pub fn identified(id: Uuid, name: String) -> Self {
        Self {
            connection: "identified",
            profile: Some(ProfileRef { id, name }),
            reason: None,
            code: None,
            comment: None,
            error: None,
        }
    }

    pub fn disconnected(id: Uuid, name: String, reason: &DisconnectReason) -> Self {
        let mut status = Self {
            connection: "disconnected",
            profile: Some(ProfileRef { id, name }),
            reason: None,
            code: None,
            comment: None,
            error: None,
        };
        match reason {
            DisconnectReason::Error { message } => {
                status.reason = Some("error");
                status.error = Some(message.clone());
            }
            // Every close frame is "closed"; the code tells normal from
            // abnormal. "error" is reserved for transport failures.
            DisconnectReason::Closed { code, comment } => {
                status.reason = Some("closed");
                status.code = Some(*code);
                status.comment = Some(comment.clone());
            }
            DisconnectReason::PolicyViolation => {
                status.reason = Some("error");
                status.error = Some("authentication required but no secret configured".into());
            }
        }
        status
    }

    pub fn idle() -> Self {
        Self {
            connection: "disconnected",
            profile: None,
            reason: None,
            code: None,
            comment: None,
            error: None,
        }
    }
}

// ── Session registry ─────────────────────────────────────────────────

/// Opaque per-session identifier, minted on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Fan-out registry for attached sessions.
///
/// Sends are best-effort: a session whose receiver is gone is skipped,
/// and its entry is removed when the session detaches.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and hand back its outbound queue.
    pub fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = SessionId(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, tx);
        }
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one message to every attached session.
    pub fn broadcast(&self, message: &ServerMessage) {
        let Ok(sessions) = self.sessions.lock() else {
            return;
        };
        for (id, tx) in sessions.iter() {
            if tx.send(message.clone()).is_err() {
                debug!(session = %id, "dropping message for closed session");
            }
        }
    }

    /// Deliver one message to a single session.
    pub fn send_to(&self, id: SessionId, message: ServerMessage) {
        let Ok(sessions) = self.sessions.lock() else {
            return;
        };
        if let Some(tx) = sessions.get(&id) {
            let _ = tx.send(message);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn server_messages_tag_by_type() {
        let message = ServerMessage::ObsMessage(json!({"op": 5}));
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "obs_message");
        assert_eq!(value["data"]["op"], 5);
    }

    #[test]
    fn switch_profile_parses() {
        let id = Uuid::new_v4();
        let raw = json!({"type": "switch_profile", "data": {"id": id}});
        let parsed: ClientMessage = serde_json::from_value(raw).expect("deserialize");
        let ClientMessage::SwitchProfile { id: parsed_id } = parsed;
        assert_eq!(parsed_id, id);
    }

    #[test]
    fn identified_status_reports_identified() {
        let status = ObsStatus::identified(Uuid::new_v4(), "Studio".into());
        assert_eq!(status.connection, "identified");
        assert!(status.profile.is_some());
    }

    #[test]
    fn every_close_frame_reports_closed_with_its_code() {
        for code in [1000u16, 1006] {
            let status = ObsStatus::disconnected(
                Uuid::new_v4(),
                "Studio".into(),
                &DisconnectReason::Closed {
                    code,
                    comment: "bye".into(),
                },
            );
            assert_eq!(status.reason, Some("closed"));
            assert_eq!(status.code, Some(code));
        }
    }

    #[test]
    fn transport_failures_report_error() {
        let status = ObsStatus::disconnected(
            Uuid::new_v4(),
            "Studio".into(),
            &DisconnectReason::Error {
                message: "connection refused".into(),
            },
        );
        assert_eq!(status.reason, Some("error"));
        assert_eq!(status.error.as_deref(), Some("connection refused"));
        assert!(status.code.is_none());
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let registry = ClientRegistry::new();
        let (_a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();
        assert_eq!(registry.len(), 2);

        registry.broadcast(&ServerMessage::ObsMessage(json!({"op": 5})));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        registry.unregister(b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_sessions_are_skipped_not_pruned() {
        let registry = ClientRegistry::new();
        let (_gone, rx_gone) = registry.register();
        let (_live, mut rx_live) = registry.register();
        drop(rx_gone);

        registry.broadcast(&ServerMessage::ObsMessage(json!({"op": 5})));
        assert!(rx_live.try_recv().is_ok());
        // Pruning happens only on unregister.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn auth_failed_status_carries_no_client_id() {
        let value = serde_json::to_value(ServerMessage::RelayConnectionStatus(
            ConnectionStatus::auth_failed(),
        ))
        .expect("serialize");
        assert_eq!(value["type"], "relay_connection_status");
        assert_eq!(value["data"]["status"], "auth_failed");
        assert!(value["data"].get("clientId").is_none());
    }
}
