//! HMAC-SHA256 webhook signatures in the `sha256=<hex>` header format.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header must look like sha256=<hex>")]
    Malformed,
    #[error("signature does not match")]
    Mismatch,
}

/// Decode the digest carried by a signature header.
pub fn parse_header(header: &str) -> Result<Vec<u8>, SignatureError> {
    let digest = header.strip_prefix(PREFIX).ok_or(SignatureError::Malformed)?;
    hex::decode(digest).map_err(|_| SignatureError::Malformed)
}

/// Check `body` against `digest` in constant time.
pub fn verify(key: &[u8], body: &[u8], digest: &[u8]) -> Result<(), SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);
    mac.verify_slice(digest).map_err(|_| SignatureError::Mismatch)
}

/// The header value a sender computes for `body`.
pub fn sign(key: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
