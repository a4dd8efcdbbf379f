//! Click-link tokens.
//!
//! A token is the hex SHA-256 of `sender-recipient-url-secret`. The input
//! ordering must not change: issued links carry tokens computed this way.

use sha2::{Digest, Sha256};

pub fn compute_token(sender: &str, recipient: &str, url: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{sender}-{recipient}-{url}-{secret}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Exact comparison against the recomputed token.
pub fn token_matches(
    supplied: &str,
    sender: &str,
    recipient: &str,
    url: &str,
    secret: &str,
) -> bool {
    supplied == compute_token(sender, recipient, url, secret)
}
