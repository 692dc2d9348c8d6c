use sha2::{Digest, Sha256};

pub mod assertion;
pub mod hawk;
pub mod session;

/// Hex-encoded SHA-256, used for derived user ids and the websocket
/// handshake signature.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
