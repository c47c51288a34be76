//! Relay domain layer.
//!
//! Profiles and automation rules, the configuration store seam, the
//! session registry with its wire messages, the event rule engine, and
//! the `Relay` coordinator that binds them to one device connection.

pub mod engine;
pub mod error;
pub mod model;
pub mod relay;
pub mod sessions;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::RelayError;
pub use model::{Action, CommandStep, ConnectionDescriptor, Profile, ProfileSummary, Trigger};
pub use relay::Relay;
pub use sessions::{ClientMessage, ServerMessage, SessionId};
pub use store::{ConfigStore, MemoryStore, StoreError};
