//! obs-websocket v5 challenge-response authentication.
//!
//! The hello message advertises a `challenge` and `salt`; the client
//! proves knowledge of the shared secret without sending it:
//!
//! ```text
//! base64(sha256(base64(sha256(secret + salt)) + challenge))
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Compute the authentication string for an identify message.
pub fn auth_response(secret: &SecretString, salt: &str, challenge: &str) -> String {
    let hashed_secret = sha256_base64(&format!("{}{salt}", secret.expose_secret()));
    sha256_base64(&format!("{hashed_secret}{challenge}"))
}

fn sha256_base64(input: &str) -> String {
    BASE64.encode(Sha256::digest(input.as_bytes()))
}

// ── Tests ────────────────────────────────────────────────────────────
