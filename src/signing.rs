//! HMAC-SHA256 request signing.
//!
//! Signatures are lowercase hex. Verification compares the hex bytes in
//! constant time, so a wrong signature leaks nothing about where it first
//! differs. Inputs of the wrong length or with non-hex characters simply
//! fail to match.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute `HMAC-SHA256(secret, message)` as lowercase hex.
pub fn sign(secret: &[u8], message: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any size"),
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compare two signature strings in constant time.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Message signed in request headers: `"{timestamp}:{body}"`.
pub fn header_message(timestamp: &str, body: &str) -> String {
    format!("{}:{}", timestamp, body)
}

/// Message signed for replay-protected payloads: `"{payload}:{timestamp}"`.
pub fn replay_message(payload: &str, timestamp: i64) -> String {
    format!("{}:{}", payload, timestamp)
}
