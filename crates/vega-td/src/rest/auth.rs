//! Session authentication helpers.
//!
//! A trading session is obtained once per day by exchanging the
//! `request_token` from the login redirect for an `access_token`. The request
//! carries a checksum instead of the secret itself:
//!
//! ```text
//! checksum = hex(SHA-256(api_key + request_token + api_secret))
//! ```
//!
//! Every later request authenticates with the
//! `Authorization: token <api_key>:<access_token>` header.

use sha2::{Digest, Sha256};

/// Compute the session checksum and return it as a lowercase hex string.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Value of the `Authorization` header for an established session.
pub fn authorization_header(api_key: &str, access_token: &str) -> String {
    format!("token {api_key}:{access_token}")
}
