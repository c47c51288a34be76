//! Device connection lifecycle and request correlation.
//!
//! A [`DeviceClient`] owns one background task that drives at most one
//! WebSocket connection to the device at a time: connect, handshake,
//! authenticate, then pump frames until the connection drops. Consumers
//! observe the connection through three channels:
//!
//! * a [`watch`] channel of [`ConnectionState`],
//! * a [`broadcast`] channel of every raw inbound [`Envelope`]
//!   (handshake traffic included),
//! * a [`broadcast`] channel of [`DeviceNotice`] lifecycle events.
//!
//! Correlated requests go through [`DeviceClient::dispatch`], which
//! registers a oneshot completion slot keyed by a fresh request id and
//! suspends the caller until the matching response or the deadline.
//!
//! An abnormal disconnect schedules exactly one reconnect attempt after
//! a fixed delay, indefinitely, as long as no newer connect request has
//! superseded the endpoint. Deliberate switches close with the normal
//! closure code and never trigger the retry path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::auth;
use crate::error::Error;
use crate::protocol::{Envelope, opcode};

// ── Tunables ─────────────────────────────────────────────────────────

/// Deadline for a correlated request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed delay before the single scheduled reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const MESSAGE_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// RFC 6455 normal closure. Never triggers a reconnect.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

// ── Endpoint ─────────────────────────────────────────────────────────

/// Everything needed to reach one device: where, and with what secret.
///
/// Carries the owning profile's identity so lifecycle notices can name
/// the profile they belong to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub profile_id: Uuid,
    pub profile_name: String,
    pub url: Url,
    pub secret: Option<SecretString>,
}

// ── Connection state ─────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Authenticating,
    Identified,
}

// ── Lifecycle notices ────────────────────────────────────────────────

/// Lifecycle events emitted alongside the raw message stream.
#[derive(Debug, Clone)]
pub enum DeviceNotice {
    /// The device acknowledged the identify message.
    Identified {
        profile_id: Uuid,
        profile_name: String,
    },

    /// The connection ended. Deliberate endpoint switches do not emit
    /// this -- the consumer initiated those and a new connection follows
    /// immediately.
    Disconnected {
        profile_id: Uuid,
        profile_name: String,
        reason: DisconnectReason,
    },
}

/// Why a connection ended.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Transport-level failure (connect error, broken stream).
    Error { message: String },

    /// The device sent a close frame.
    Closed { code: u16, comment: String },

    /// Authentication required but the endpoint has no secret.
    /// Never retried automatically.
    PolicyViolation,
}

// ── DeviceClient ─────────────────────────────────────────────────────

enum Command {
    Connect(Box<Endpoint>),
    Disconnect,
}

/// Handle to the device connection task. Cheaply cloneable.
#[derive(Clone)]
pub struct DeviceClient {
    inner: Arc<Inner>,
    command_tx: mpsc::Sender<Command>,
}

struct Inner {
    state_tx: watch::Sender<ConnectionState>,
    message_tx: broadcast::Sender<Arc<Envelope>>,
    notice_tx: broadcast::Sender<DeviceNotice>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Value, Error>>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl DeviceClient {
    /// Create the client and spawn its connection task. No connection is
    /// attempted until [`connect`](Self::connect) names an endpoint.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            state_tx,
            message_tx,
            notice_tx,
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            connection_task(task_inner, command_rx).await;
        });

        Self { inner, command_tx }
    }

    /// Connect to an endpoint, tearing down any current connection first.
    ///
    /// The old socket is closed with the normal closure code and its
    /// pending requests fail with [`Error::NotConnected`] before the new
    /// connection is attempted.
    pub async fn connect(&self, endpoint: Endpoint) {
        let _ = self
            .command_tx
            .send(Command::Connect(Box::new(endpoint)))
            .await;
    }

    /// Close the current connection (normal closure) and stay idle.
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect).await;
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx().subscribe()
    }

    /// The connection state right now.
    pub fn current_state(&self) -> ConnectionState {
        self.state_tx().borrow().clone()
    }

    /// Subscribe to the raw inbound message stream.
    ///
    /// Every frame the device sends is delivered in socket order,
    /// including hello/identified traffic during the handshake.
    pub fn messages(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.inner.message_tx.subscribe()
    }

    /// Subscribe to lifecycle notices.
    pub fn notices(&self) -> broadcast::Receiver<DeviceNotice> {
        self.inner.notice_tx.subscribe()
    }

    fn state_tx(&self) -> &watch::Sender<ConnectionState> {
        &self.inner.state_tx
    }

    // ── Correlator ───────────────────────────────────────────────────

    /// Send a correlated request and await its response.
    ///
    /// Fails immediately with [`Error::NotConnected`] unless the
    /// connection is in the Identified state -- the request never
    /// reaches the socket. Otherwise a fresh correlation id is
    /// registered and the caller suspends until the matching response
    /// arrives or [`REQUEST_TIMEOUT`] elapses. A disconnect fails all
    /// outstanding requests at once; callers never wait out the original
    /// deadline past a disconnect.
    pub async fn dispatch(&self, request_type: &str, request_data: Value) -> Result<Value, Error> {
        if *self.inner.state_tx.borrow() != ConnectionState::Identified {
            return Err(Error::NotConnected);
        }

        let request_id = Uuid::new_v4();
        let (response_tx, response_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(request_id, response_tx);

        let envelope = Envelope::request(request_id, request_type, request_data);
        if !self.inner.send_envelope(&envelope).await {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(Error::NotConnected);
        }

        trace!(%request_id, request_type, "request dispatched");

        match tokio::time::timeout(REQUEST_TIMEOUT, response_rx).await {
            Ok(Ok(result)) => result,
            // Completion slot dropped: the connection tore down between
            // registration and resolution.
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                warn!(%request_id, request_type, "request timed out");
                Err(Error::Timeout {
                    timeout_secs: REQUEST_TIMEOUT.as_secs(),
                })
            }
        }
    }
}

impl Default for DeviceClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Inner helpers ────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn notify(&self, notice: DeviceNotice) {
        // No subscribers is fine -- the relay may not be wired up yet.
        let _ = self.notice_tx.send(notice);
    }

    async fn set_writer(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.writer.lock().await = Some(tx);
    }

    async fn take_writer(&self) {
        self.writer.lock().await.take();
    }

    /// Queue an envelope for the socket writer. Returns `false` when no
    /// connection is current.
    async fn send_envelope(&self, envelope: &Envelope) -> bool {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound envelope");
                return false;
            }
        };
        let guard = self.writer.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(Message::text(text)).is_ok(),
            None => false,
        }
    }

    /// Resolve the pending request a response frame correlates with.
    async fn resolve_pending(&self, envelope: &Envelope) {
        let Some(response) = envelope.request_response() else {
            // Status field absent -- must not complete anything.
            return;
        };
        let Ok(request_id) = Uuid::parse_str(&response.request_id) else {
            debug!(request_id = %response.request_id, "response with foreign correlation id");
            return;
        };
        let Some(tx) = self.pending.lock().await.remove(&request_id) else {
            debug!(%request_id, "response with no pending request");
            return;
        };

        let result = if response.request_status.result {
            Ok(response.response_data)
        } else {
            Err(Error::Device {
                comment: response
                    .request_status
                    .comment
                    .unwrap_or_else(|| "device request failed".into()),
            })
        };
        let _ = tx.send(result);
    }

    /// Fail every outstanding request with `NotConnected`, immediately.
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "failing pending requests on disconnect");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::NotConnected));
        }
    }
}

// ── Connection task ──────────────────────────────────────────────────

enum Outcome {
    /// A connect command arrived; tear down and dial the new endpoint.
    Switch(Box<Endpoint>),
    /// An explicit disconnect; go idle.
    Stop,
    /// All client handles dropped; exit the task.
    Shutdown,
    /// Auth demanded with no secret configured. No reconnect.
    Policy,
    /// The device sent a close frame.
    RemoteClose { code: u16, comment: String },
    /// Transport failure (dial error, IO error, stream ended).
    Failed { message: String },
}

async fn connection_task(inner: Arc<Inner>, mut command_rx: mpsc::Receiver<Command>) {
    let mut next: Option<Endpoint> = None;

    loop {
        let endpoint = match next.take() {
            Some(endpoint) => endpoint,
            None => match command_rx.recv().await {
                Some(Command::Connect(endpoint)) => *endpoint,
                Some(Command::Disconnect) => continue,
                None => break,
            },
        };

        inner.set_state(ConnectionState::Connecting);
        let outcome = run_connection(&inner, &endpoint, &mut command_rx).await;

        // Teardown order matters: detach the writer first so late
        // dispatches fail fast, then clear in-flight calls, then record
        // the state.
        inner.take_writer().await;
        inner.fail_pending().await;
        inner.set_state(ConnectionState::Disconnected);

        match outcome {
            Outcome::Switch(endpoint) => next = Some(*endpoint),
            Outcome::Stop => {}
            Outcome::Shutdown => break,
            Outcome::Policy => {
                inner.notify(DeviceNotice::Disconnected {
                    profile_id: endpoint.profile_id,
                    profile_name: endpoint.profile_name.clone(),
                    reason: DisconnectReason::PolicyViolation,
                });
            }
            Outcome::RemoteClose { code, comment } => {
                inner.notify(DeviceNotice::Disconnected {
                    profile_id: endpoint.profile_id,
                    profile_name: endpoint.profile_name.clone(),
                    reason: DisconnectReason::Closed {
                        code,
                        comment: comment.clone(),
                    },
                });
                if code == CLOSE_CODE_NORMAL {
                    info!(profile = %endpoint.profile_name, "device closed normally, staying idle");
                } else {
                    match wait_reconnect(&mut command_rx, endpoint).await {
                        AfterDelay::Dial(endpoint) => next = Some(endpoint),
                        AfterDelay::Idle => {}
                        AfterDelay::Shutdown => break,
                    }
                }
            }
            Outcome::Failed { message } => {
                warn!(profile = %endpoint.profile_name, error = %message, "device connection failed");
                inner.notify(DeviceNotice::Disconnected {
                    profile_id: endpoint.profile_id,
                    profile_name: endpoint.profile_name.clone(),
                    reason: DisconnectReason::Error { message },
                });
                match wait_reconnect(&mut command_rx, endpoint).await {
                    AfterDelay::Dial(endpoint) => next = Some(endpoint),
                    AfterDelay::Idle => {}
                    AfterDelay::Shutdown => break,
                }
            }
        }
    }

    debug!("device connection task exiting");
}

enum AfterDelay {
    Dial(Endpoint),
    Idle,
    Shutdown,
}

/// Wait out the fixed reconnect delay for the endpoint that just failed.
///
/// One timer at a time, structurally: this task is the only place a
/// reconnect can be scheduled, and a connect/disconnect command
/// interrupts the delay, so an endpoint the user has abandoned is never
/// redialed.
async fn wait_reconnect(command_rx: &mut mpsc::Receiver<Command>, endpoint: Endpoint) -> AfterDelay {
    info!(
        profile = %endpoint.profile_name,
        delay_secs = RECONNECT_DELAY.as_secs(),
        "scheduling reconnect"
    );
    tokio::select! {
        biased;
        command = command_rx.recv() => match command {
            Some(Command::Connect(endpoint)) => AfterDelay::Dial(*endpoint),
            Some(Command::Disconnect) => AfterDelay::Idle,
            None => AfterDelay::Shutdown,
        },
        () = tokio::time::sleep(RECONNECT_DELAY) => AfterDelay::Dial(endpoint),
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Dial the endpoint and pump frames until the connection ends.
async fn run_connection(
    inner: &Arc<Inner>,
    endpoint: &Endpoint,
    command_rx: &mut mpsc::Receiver<Command>,
) -> Outcome {
    info!(profile = %endpoint.profile_name, url = %endpoint.url, "connecting to device");

    let uri: tungstenite::http::Uri = match endpoint.url.as_str().parse() {
        Ok(uri) => uri,
        Err(e) => {
            return Outcome::Failed {
                message: e.to_string(),
            };
        }
    };
    let request = ClientRequestBuilder::new(uri);

    let ws_stream = match tokio_tungstenite::connect_async(request).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            return Outcome::Failed {
                message: e.to_string(),
            };
        }
    };

    inner.set_state(ConnectionState::AwaitingHandshake);
    debug!("transport open, waiting for hello");

    let (mut sink, mut stream) = ws_stream.split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
    inner.set_writer(write_tx).await;

    loop {
        tokio::select! {
            biased;
            command = command_rx.recv() => {
                // Deliberate teardown: normal closure, and the caller's
                // next step decides what happens after.
                let _ = sink.send(close_frame(CloseCode::Normal, "switching profiles")).await;
                return match command {
                    Some(Command::Connect(endpoint)) => Outcome::Switch(endpoint),
                    Some(Command::Disconnect) => Outcome::Stop,
                    None => Outcome::Shutdown,
                };
            }
            outbound = write_rx.recv() => {
                let Some(outbound) = outbound else {
                    return Outcome::Failed { message: "writer channel closed".into() };
                };
                if let Err(e) = sink.send(outbound).await {
                    return Outcome::Failed { message: e.to_string() };
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let FrameAction::Policy = handle_frame(inner, endpoint, text.as_str()).await {
                        let _ = sink
                            .send(close_frame(
                                CloseCode::Policy,
                                "authentication required but no secret configured",
                            ))
                            .await;
                        return Outcome::Policy;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite answers pings automatically
                    trace!("device ping");
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, comment) = match close {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    info!(code, comment = %comment, "device closed the connection");
                    return Outcome::RemoteClose { code, comment };
                }
                Some(Err(e)) => {
                    return Outcome::Failed { message: e.to_string() };
                }
                None => {
                    return Outcome::Failed { message: "stream ended without close frame".into() };
                }
                _ => {
                    // Binary, Pong, Frame -- ignore
                }
            }
        }
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

// ── Inbound frame handling ───────────────────────────────────────────

enum FrameAction {
    Continue,
    Policy,
}

/// Interpret one inbound text frame, then publish it to subscribers.
///
/// Handshake transitions and correlator resolution happen before the
/// raw broadcast so a consumer reacting to the frame observes the
/// post-transition state.
async fn handle_frame(inner: &Arc<Inner>, endpoint: &Endpoint, text: &str) -> FrameAction {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "unparseable device frame");
            return FrameAction::Continue;
        }
    };

    let action = match envelope.op {
        opcode::HELLO => handle_hello(inner, endpoint, &envelope).await,
        opcode::IDENTIFIED => {
            inner.set_state(ConnectionState::Identified);
            info!(profile = %endpoint.profile_name, "device identified");
            inner.notify(DeviceNotice::Identified {
                profile_id: endpoint.profile_id,
                profile_name: endpoint.profile_name.clone(),
            });
            FrameAction::Continue
        }
        opcode::REQUEST_RESPONSE => {
            inner.resolve_pending(&envelope).await;
            FrameAction::Continue
        }
        _ => FrameAction::Continue,
    };

    // Every inbound frame is observable, handshake traffic included.
    let _ = inner.message_tx.send(Arc::new(envelope));

    action
}

async fn handle_hello(inner: &Arc<Inner>, endpoint: &Endpoint, envelope: &Envelope) -> FrameAction {
    let Some(hello) = envelope.hello() else {
        warn!("malformed hello payload");
        return FrameAction::Continue;
    };

    match (&hello.authentication, &endpoint.secret) {
        (Some(challenge), Some(secret)) => {
            debug!("hello advertises auth challenge, identifying with credentials");
            let response = auth::auth_response(secret, &challenge.salt, &challenge.challenge);
            inner.set_state(ConnectionState::Authenticating);
            if !inner
                .send_envelope(&Envelope::identify(hello.rpc_version, Some(response)))
                .await
            {
                warn!("failed to queue identify message");
            }
            FrameAction::Continue
        }
        (None, _) => {
            debug!("hello requires no auth, identifying");
            if !inner
                .send_envelope(&Envelope::identify(hello.rpc_version, None))
                .await
            {
                warn!("failed to queue identify message");
            }
            FrameAction::Continue
        }
        (Some(_), None) => {
            error!(
                profile = %endpoint.profile_name,
                "device requires authentication but the profile has no secret"
            );
            FrameAction::Policy
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
