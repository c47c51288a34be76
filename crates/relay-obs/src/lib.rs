//! Async client for obs-websocket protocol v5.
//!
//! This crate owns the device half of the relay: the `{op, d}` message
//! envelope, challenge-response authentication, the connection state
//! machine with fixed-delay reconnect, and the correlator that turns the
//! multiplexed socket into call-and-await request dispatch.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_obs::{DeviceClient, Endpoint};
//!
//! let client = DeviceClient::new();
//! client.connect(endpoint).await;
//!
//! let mut messages = client.messages();
//! while let Ok(envelope) = messages.recv().await {
//!     println!("op {}", envelope.op);
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod protocol;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{
    CLOSE_CODE_NORMAL, ConnectionState, DeviceClient, DeviceNotice, DisconnectReason, Endpoint,
    RECONNECT_DELAY, REQUEST_TIMEOUT,
};
pub use error::Error;
pub use protocol::{Envelope, EventPayload, HelloPayload, RequestResponsePayload, opcode};
