//! Correlation identifiers.

use rand::RngCore;
use rand::rngs::OsRng;

/// Number of random bytes in a message id.
pub const MESSAGE_ID_BYTES: usize = 6;

/// Generate a fresh message id: 6 random bytes, hex-encoded.
pub fn message_id() -> String {
    let mut bytes = [0u8; MESSAGE_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Number of random bytes in a session key id.
pub const KEY_ID_BYTES: usize = 16;

/// Generate a session key id so two keys minted in the same second differ.
pub fn key_id() -> String {
    let mut bytes = [0u8; KEY_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
