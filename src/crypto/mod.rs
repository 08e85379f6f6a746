//! Cryptography Module - Tokens and deterministic identifiers
//!
//! Invite tokens carry 128 bits of OS-seeded randomness. The timestamp prefix
//! only makes them sortable; it contributes nothing to unguessability.

mod hashing;

pub use hashing::ContentHash;

use rand::RngCore;

/// Entropy carried by every invite token, in bytes
pub const TOKEN_ENTROPY_BYTES: usize = 16;

/// Secure random bytes generator
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate an opaque invite token: `<hex millis>.<base58 entropy>`.
pub fn generate_invite_token() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let entropy = random_bytes(TOKEN_ENTROPY_BYTES);
    format!("{:011x}.{}", millis, bs58::encode(entropy).into_string())
}

/// Derive a stable document id from a natural key.
pub fn derive_id(namespace: &str, parts: &[&str]) -> String {
    // 128 bits of the digest is plenty for a document id
    ContentHash::of_parts(namespace, parts).to_hex()[..32].to_string()
}
