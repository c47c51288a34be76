//! WebSocket listener for control-surface sessions.
//!
//! Each accepted socket becomes one session on the relay: outbound
//! messages drain from the session's queue, inbound frames are parsed
//! as client commands. An optional shared token gates the handshake.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use relay_core::sessions::{ConnectionStatus, ServerMessage};
use relay_core::{ClientMessage, Relay};

/// The bound session listener.
pub struct SessionServer {
    listener: TcpListener,
    auth_token: Option<String>,
}

impl SessionServer {
    /// Bind the listener. Binding early surfaces address conflicts
    /// before the relay dials any device.
    pub async fn bind(
        listen: SocketAddr,
        auth_token: Option<String>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| ServerError::Bind {
                addr: listen.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            auth_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept sessions until cancelled.
    pub async fn serve(self, relay: Relay, cancel: CancellationToken) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "session listener ready");

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "session connecting");
            let relay = relay.clone();
            let cancel = cancel.clone();
            let token = self.auth_token.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_session(relay, stream, token, cancel).await {
                    debug!(%peer, error = %e, "session ended with error");
                }
            });
        }

        info!("session listener stopped");
        Ok(())
    }
}

// ── Per-session handling ─────────────────────────────────────────────

async fn handle_session(
    relay: Relay,
    stream: TcpStream,
    auth_token: Option<String>,
    cancel: CancellationToken,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    // Capture the presented token during the handshake; the verdict is
    // delivered in-band after the upgrade so clients get a parseable
    // refusal instead of a bare HTTP error.
    let mut presented: Option<String> = None;
    let socket = accept_hdr_async(stream, |request: &Request, response: Response| {
        presented = request
            .uri()
            .query()
            .and_then(|query| query.split('&').find_map(|p| p.strip_prefix("token=")))
            .map(str::to_string);
        Ok(response)
    })
    .await?;
    let (mut sink, mut source) = socket.split();

    if let Some(expected) = auth_token.as_deref() {
        if presented.as_deref() != Some(expected) {
            warn!("session rejected: bad or missing token");
            if let Ok(text) = serde_json::to_string(&ServerMessage::RelayConnectionStatus(
                ConnectionStatus::auth_failed(),
            )) {
                let _ = sink.send(Message::text(text)).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        }
    }

    let (session, mut outbound) = relay.attach_session().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(session = %session, error = %e, "unserializable session message"),
                }
            }

            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => relay.handle_client_message(session, message).await,
                            Err(e) => {
                                debug!(session = %session, error = %e, "ignoring unparseable session frame");
                            }
                        }
                    }
                    // Pongs are queued by the protocol layer; binary
                    // frames carry nothing the relay understands.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session = %session, error = %e, "session socket error");
                        break;
                    }
                }
            }
        }
    }

    relay.detach_session(session);
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use tokio_tungstenite::connect_async;
    use url::Url;
    use uuid::Uuid;

    use relay_core::{MemoryStore, Profile};

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_relay(profiles: &[Profile]) -> Relay {
        let store = Arc::new(MemoryStore::new());
        for p in profiles {
            store.upsert_profile(p.clone()).expect("upsert");
        }
        let relay = Relay::new(store);
        relay.start().await.expect("start");
        relay
    }

    async fn start_server(relay: &Relay, token: Option<&str>) -> (SocketAddr, CancellationToken) {
        let server = SessionServer::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            token.map(str::to_string),
        )
        .await
        .expect("bind");
        let addr = server.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(relay.clone(), cancel.clone()));
        (addr, cancel)
    }

    async fn recv_json<S>(socket: &mut S) -> serde_json::Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(WAIT, socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("valid json");
            }
        }
    }

    fn profile(name: &str) -> Profile {
        Profile::new(
            name,
            Url::parse("ws://127.0.0.1:9").expect("url"),
            Some(SecretString::from("device-secret".to_string())),
        )
    }

    #[tokio::test]
    async fn sessions_receive_the_initial_snapshot() {
        let relay = start_relay(&[profile("Studio")]).await;
        let (addr, cancel) = start_server(&relay, None).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");

        let first = recv_json(&mut socket).await;
        assert_eq!(first["type"], "relay_connection_status");
        assert_eq!(first["data"]["status"], "connected");

        let second = recv_json(&mut socket).await;
        assert_eq!(second["type"], "relay_obs_status");

        let third = recv_json(&mut socket).await;
        assert_eq!(third["type"], "relay_connection_profiles");
        assert_eq!(third["data"][0]["name"], "Studio");
        // The projection never carries device credentials.
        assert!(third["data"][0].get("secret").is_none());
        assert!(third["data"][0].get("password").is_none());

        cancel.cancel();
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn switch_profile_over_the_socket_broadcasts_profiles() {
        let a = profile("a");
        let b = profile("b");
        let b_id = b.id;
        let relay = start_relay(&[a, b]).await;
        let (addr, cancel) = start_server(&relay, None).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");
        for _ in 0..3 {
            recv_json(&mut socket).await;
        }

        let command = serde_json::json!({
            "type": "switch_profile",
            "data": {"id": b_id}
        });
        socket
            .send(Message::text(command.to_string()))
            .await
            .expect("send");

        // Scan past interleaved device status messages.
        let profiles = loop {
            let message = recv_json(&mut socket).await;
            if message["type"] == "relay_connection_profiles" {
                break message["data"].clone();
            }
        };
        let active = profiles
            .as_array()
            .expect("array")
            .iter()
            .find(|p| p["active"] == true)
            .expect("an active profile");
        assert_eq!(active["id"], b_id.to_string());

        cancel.cancel();
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn token_gate_refuses_bad_or_missing_tokens_in_band() {
        let relay = start_relay(&[]).await;
        let (addr, cancel) = start_server(&relay, Some("sesame")).await;

        for url in [
            format!("ws://{addr}"),
            format!("ws://{addr}/?token=wrong"),
        ] {
            let (mut socket, _) = connect_async(url).await.expect("handshake still upgrades");
            let refusal = recv_json(&mut socket).await;
            assert_eq!(refusal["type"], "relay_connection_status");
            assert_eq!(refusal["data"]["status"], "auth_failed");
            assert!(refusal["data"].get("clientId").is_none());
            // The relay closes right after the refusal.
            let next = tokio::time::timeout(WAIT, socket.next())
                .await
                .expect("timed out");
            assert!(!matches!(next, Some(Ok(Message::Text(_)))));
        }

        let (mut socket, _) = connect_async(format!("ws://{addr}/?token=sesame"))
            .await
            .expect("correct token accepted");
        let first = recv_json(&mut socket).await;
        assert_eq!(first["type"], "relay_connection_status");
        assert_eq!(first["data"]["status"], "connected");

        cancel.cancel();
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_switch_is_reported_to_the_sender() {
        let relay = start_relay(&[profile("Studio")]).await;
        let (addr, cancel) = start_server(&relay, None).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");
        for _ in 0..3 {
            recv_json(&mut socket).await;
        }

        let command = serde_json::json!({
            "type": "switch_profile",
            "data": {"id": Uuid::new_v4()}
        });
        socket
            .send(Message::text(command.to_string()))
            .await
            .expect("send");

        let report = loop {
            let message = recv_json(&mut socket).await;
            if message["type"] == "relay_error" {
                break message;
            }
        };
        assert!(
            report["data"]["message"]
                .as_str()
                .expect("message text")
                .contains("not found")
        );

        cancel.cancel();
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_frames_do_not_kill_the_session() {
        let relay = start_relay(&[profile("Studio")]).await;
        let (addr, cancel) = start_server(&relay, None).await;

        let (mut socket, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");
        for _ in 0..3 {
            recv_json(&mut socket).await;
        }

        socket
            .send(Message::text("{not json"))
            .await
            .expect("send garbage");
        socket
            .send(Message::text(r#"{"type":"unknown_command"}"#))
            .await
            .expect("send unknown");

        // The session still answers a valid command afterwards.
        let unknown = Uuid::new_v4();
        let command = serde_json::json!({
            "type": "switch_profile",
            "data": {"id": unknown}
        });
        socket
            .send(Message::text(command.to_string()))
            .await
            .expect("send valid");

        // Rejected switch leaves the session open; ping proves it.
        socket
            .send(Message::Ping(vec![1].into()))
            .await
            .expect("ping");
        loop {
            let frame = tokio::time::timeout(WAIT, socket.next())
                .await
                .expect("timed out")
                .expect("socket closed")
                .expect("socket error");
            // The rejected switch also produces a relay_error text frame.
            if matches!(frame, Message::Pong(_)) {
                break;
            }
        }

        cancel.cancel();
        relay.shutdown().await;
    }
}
