// ── Relay error types ──
//
// Relay-facing errors. Consumers never see raw transport failures --
// the `From<relay_obs::Error>` impl translates the device layer into
// the relay's taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Unified error type for the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Dispatch errors ──────────────────────────────────────────────
    #[error("Device is not connected")]
    NotConnected,

    #[error("Device request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Device rejected request: {comment}")]
    Device { comment: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Device requires authentication but the profile has no secret")]
    PolicyViolation,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Profile not found: {id}")]
    ProfileNotFound { id: Uuid },

    #[error("Activation transaction failed: {message}")]
    Transaction { message: String },

    #[error("No profile is active")]
    NoActiveProfile,

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from the device layer ─────────────────────────────────

impl From<relay_obs::Error> for RelayError {
    fn from(err: relay_obs::Error) -> Self {
        match err {
            relay_obs::Error::NotConnected => RelayError::NotConnected,
            relay_obs::Error::Timeout { timeout_secs } => RelayError::Timeout { timeout_secs },
            relay_obs::Error::Device { comment } => RelayError::Device { comment },
            relay_obs::Error::PolicyViolation => RelayError::PolicyViolation,
            // Transport failures surface as a plain disconnect to
            // dispatch callers.
            relay_obs::Error::Connect(_) | relay_obs::Error::Closed { .. } => {
                RelayError::NotConnected
            }
            relay_obs::Error::InvalidUrl(e) => RelayError::Internal(format!("invalid URL: {e}")),
            relay_obs::Error::Protocol { message } => RelayError::Internal(message),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProfileNotFound { id } => RelayError::ProfileNotFound { id },
            StoreError::Transaction { message } => RelayError::Transaction { message },
        }
    }
}
