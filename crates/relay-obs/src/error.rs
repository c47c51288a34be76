use thiserror::Error;

/// Top-level error type for the `relay-obs` crate.
///
/// Covers every failure mode of the device connection: the transport,
/// the identify handshake, and correlated request dispatch.
/// `relay-core` maps these into relay-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Dispatch ────────────────────────────────────────────────────
    /// The device socket is not in the Identified state.
    #[error("Device is not connected")]
    NotConnected,

    /// No response arrived for a correlated request within the deadline.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The device answered a request with a failure status.
    #[error("Device rejected request: {comment}")]
    Device { comment: String },

    // ── Handshake ───────────────────────────────────────────────────
    /// The device requires authentication but no secret is configured.
    /// Fatal for the connection attempt; never retried automatically.
    #[error("Device requires authentication but no secret is configured")]
    PolicyViolation,

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket connection could not be established.
    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    /// Invalid device address.
    #[error("Invalid device URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Data ────────────────────────────────────────────────────────
    /// A frame could not be built or parsed.
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_names_the_failure() {
        assert_eq!(
            Error::Timeout { timeout_secs: 5 }.to_string(),
            "Request timed out after 5s"
        );
        assert_eq!(
            Error::Device {
                comment: "No source was found".into()
            }
            .to_string(),
            "Device rejected request: No source was found"
        );
        assert_eq!(
            Error::Closed {
                code: 1008,
                reason: "policy".into()
            }
            .to_string(),
            "WebSocket closed (code 1008): policy"
        );
    }
}
